//! Reconciliation of Kyma resources against Compass
//!
//! [`reconcile`] walks the registration state machine for one Kyma key,
//! [`admission`] decides which watch events reach it at all.

pub mod admission;
mod kyma;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

pub use admission::{admit, KymaEvent, KymaSnapshot};
pub use kyma::{error_policy, reconcile, ERROR_REQUEUE};

use crate::cluster::{KubeClient, KubeClientImpl};
use crate::compass::{Configurator, Registrant};

/// Default delay before a waiting or failed Kyma is looked at again
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the key again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Nothing left to do until the next change notification
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Delay before the next reconcile, if one is wanted
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Shared state handed to every reconcile
///
/// Built once at startup with [`ContextBuilder`]:
///
/// ```ignore
/// let ctx = Context::builder(client, registrant, configurator)
///     .requeue_interval(Duration::from_secs(10))
///     .build();
/// ```
pub struct Context {
    /// Storage accessor for Kyma resources, mappings and kubeconfig secrets
    pub kube: Arc<dyn KubeClient>,
    /// Compass registration collaborator
    pub registrant: Arc<dyn Registrant>,
    /// Runtime agent configuration collaborator
    pub configurator: Arc<dyn Configurator>,
    /// Delay used for expected waits and collaborator failures
    pub requeue_interval: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        registrant: Arc<dyn Registrant>,
        configurator: Arc<dyn Configurator>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, registrant, configurator)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        registrant: Arc<dyn Registrant>,
        configurator: Arc<dyn Configurator>,
    ) -> Self {
        Self {
            kube,
            registrant,
            configurator,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    registrant: Arc<dyn Registrant>,
    configurator: Arc<dyn Configurator>,
    requeue_interval: Duration,
}

impl ContextBuilder {
    fn new(
        client: Client,
        registrant: Arc<dyn Registrant>,
        configurator: Arc<dyn Configurator>,
    ) -> Self {
        Self {
            client,
            registrant,
            configurator,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }

    /// Set the requeue interval
    pub fn requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client)),
            registrant: self.registrant,
            configurator: self.configurator,
            requeue_interval: self.requeue_interval,
        }
    }
}
