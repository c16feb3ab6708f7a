//! Cluster access for the reconciler
//!
//! [`KubeClient`] is the raw storage accessor, [`ClusterView`] the cached,
//! per-reconcile layer the state machine talks to.

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod view;

use std::fmt;

use kube::ResourceExt;

pub use client::{KubeClient, KubeClientImpl};
#[cfg(test)]
pub(crate) use client::MockKubeClient;
pub use view::ClusterView;

use crate::crd::Kyma;

/// Namespace and name of a Kyma resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the given Kyma, `None` if it carries no namespace
    pub fn from_kyma(kyma: &Kyma) -> Option<Self> {
        Some(Self::new(kyma.namespace()?, kyma.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
