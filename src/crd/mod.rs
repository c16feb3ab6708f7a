//! Custom Resource Definitions used by Compass Manager
//!
//! `Kyma` is consumed read-only, `CompassManagerMapping` is owned by this operator.

mod kyma;
mod mapping;

pub use kyma::{Kyma, KymaSpec, Module};
pub use mapping::{
    mapping_labels, CompassManagerMapping, CompassManagerMappingSpec, CompassManagerMappingStatus,
};
