//! Collaborators that talk to Compass and to the runtime clusters
//!
//! The reconciler only sees the [`Registrant`] and [`Configurator`] traits.
//! Production wires in [`DirectorClient`] and [`RuntimeAgentConfigurator`],
//! tests use the generated mocks.

mod agent;
mod director;
mod labels;

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

pub use agent::{
    build_agent_secret, RuntimeAgentConfigurator, AGENT_SECRET_NAME, AGENT_SECRET_NAMESPACE,
};
pub use director::DirectorClient;
pub use labels::{create_compass_runtime_labels, RuntimeLabels, MANAGED_BY_RUNTIME_LABEL};

use crate::Error;

/// One-time token the Compass Runtime Agent exchanges for a client certificate
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct OneTimeToken {
    /// The token itself
    pub token: String,
    /// Connector endpoint the agent presents the token to
    #[serde(rename = "connectorURL")]
    pub connector_url: String,
}

/// Tenant a runtime lives in: its global account, or `default_tenant` if it has none
///
/// Registration, token requests and the agent secret must all agree on it.
pub fn resolve_tenant<'a>(global_account: &'a str, default_tenant: &'a str) -> &'a str {
    if global_account.is_empty() {
        default_tenant
    } else {
        global_account
    }
}

/// Registers runtimes in the Compass Director
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrant: Send + Sync {
    /// Create the runtime in Compass and return its ID
    ///
    /// Must be idempotent: registering a runtime that already exists returns
    /// the existing ID.
    async fn register_in_compass(&self, labels: &RuntimeLabels) -> Result<String, Error>;

    /// Request a new one-time connection token for a registered runtime
    async fn refresh_compass_token(
        &self,
        compass_id: &str,
        global_account: &str,
    ) -> Result<OneTimeToken, Error>;

    /// Delete the runtime from Compass
    async fn deregister_from_compass(
        &self,
        compass_id: &str,
        global_account: &str,
    ) -> Result<(), Error>;
}

/// Configures the Compass Runtime Agent inside a runtime cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Create the secret the agent uses to connect to Compass
    ///
    /// `global_account` is the one the runtime was registered under. Must be
    /// idempotent.
    async fn configure_compass_runtime_agent(
        &self,
        kubeconfig: &str,
        compass_runtime_id: &str,
        global_account: &str,
    ) -> Result<(), Error>;

    /// Refresh the connection token in an already configured runtime
    async fn update_compass_runtime_agent(&self, kubeconfig: &str) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_falls_back_to_default() {
        assert_eq!(resolve_tenant("", "default-tenant"), "default-tenant");
        assert_eq!(resolve_tenant("ga-1", "default-tenant"), "ga-1");
    }
}
