//! Compass Manager - registers Kyma runtimes in Compass and keeps their agents configured
//!
//! Every Kyma resource that enables the application connector module gets a
//! runtime in the Compass Director and a cluster-local secret the Compass
//! Runtime Agent uses to connect back. When the Kyma resource disappears the
//! runtime is deregistered again.
//!
//! # Architecture
//!
//! - A watcher feeds Kyma change notifications through an admission filter
//! - Admitted keys land in a work queue that runs at most one reconcile per key
//! - Each reconcile builds a fresh [`cluster::ClusterView`] and walks the state machine
//!   in [`controller::reconcile`]
//! - The outcome is persisted in a `CompassManagerMapping` resource: the runtime ID
//!   label is the source of truth, the status is best-effort metadata
//!
//! # Modules
//!
//! - [`crd`] - Kyma (read-only) and CompassManagerMapping resource types
//! - [`cluster`] - Storage accessor and the per-reconcile cluster view
//! - [`compass`] - Registration and agent configuration collaborators
//! - [`controller`] - Reconciliation state machine and admission filter
//! - [`runner`] - Watch loop and per-key work queue
//! - [`config`] - Command line and Director credentials configuration
//! - [`telemetry`] - Logging setup
//! - [`retry`] - Bounded exponential backoff for network calls
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cluster;
pub mod compass;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;
pub mod runner;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known labels and annotations
// =============================================================================
// Keys shared with the Kyma lifecycle manager and the Kyma environment broker.
// Mappings and kubeconfig secrets are correlated to a Kyma by LABEL_KYMA_NAME.

/// Annotation carrying a runtime ID that was registered before this operator took over
pub const ANNOTATION_ID_FOR_MIGRATION: &str = "compass-runtime-id-for-migration";

/// Broker instance that provisioned the runtime
pub const LABEL_BROKER_INSTANCE_ID: &str = "kyma-project.io/instance-id";
/// Service plan ID of the runtime
pub const LABEL_BROKER_PLAN_ID: &str = "kyma-project.io/broker-plan-id";
/// Service plan name of the runtime
pub const LABEL_BROKER_PLAN_NAME: &str = "kyma-project.io/broker-plan-name";
/// Runtime ID assigned by Compass, stored on the mapping
pub const LABEL_COMPASS_ID: &str = "kyma-project.io/compass-runtime-id";
/// Global account owning the runtime
pub const LABEL_GLOBAL_ACCOUNT_ID: &str = "kyma-project.io/global-account-id";
/// Name of the Kyma resource a mapping or secret belongs to
pub const LABEL_KYMA_NAME: &str = "operator.kyma-project.io/kyma-name";
/// Marks objects written by this operator
pub const LABEL_MANAGED_BY: &str = "operator.kyma-project.io/managed-by";
/// Gardener shoot backing the runtime
pub const LABEL_SHOOT_NAME: &str = "kyma-project.io/shoot-name";
/// Subaccount owning the runtime
pub const LABEL_SUBACCOUNT_ID: &str = "kyma-project.io/subaccount-id";

/// Value of [`LABEL_MANAGED_BY`] on mappings
pub const MANAGED_BY: &str = "compass-manager";

/// Kyma module whose presence makes a Kyma resource relevant
pub const APPLICATION_CONNECTOR_MODULE_NAME: &str = "applicationconnector";

/// Key of the kubeconfig inside the secret created by the Kyma environment broker
pub const KUBECONFIG_KEY: &str = "config";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "compass-manager";
