//! Compass Runtime Agent configuration inside runtime clusters
//!
//! The agent reads its connection parameters from a secret in the runtime.
//! Writing that secret is all the configuration it needs; the agent picks up
//! the one-time token and exchanges it for a client certificate on its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use super::{resolve_tenant, Configurator, OneTimeToken, Registrant};
use crate::{Error, FIELD_MANAGER, LABEL_MANAGED_BY, MANAGED_BY};

/// Name of the secret the agent reads its configuration from
pub const AGENT_SECRET_NAME: &str = "compass-agent-configuration";
/// Namespace of the agent configuration secret
pub const AGENT_SECRET_NAMESPACE: &str = "kyma-system";

const KEY_CONNECTOR_URL: &str = "CONNECTOR_URL";
const KEY_TOKEN: &str = "TOKEN";
const KEY_RUNTIME_ID: &str = "RUNTIME_ID";
const KEY_TENANT: &str = "TENANT";

/// Build the agent configuration secret for a runtime
pub fn build_agent_secret(runtime_id: &str, tenant: &str, token: &OneTimeToken) -> Secret {
    let data = [
        (KEY_CONNECTOR_URL, token.connector_url.as_str()),
        (KEY_TOKEN, token.token.as_str()),
        (KEY_RUNTIME_ID, runtime_id),
        (KEY_TENANT, tenant),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
    .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(AGENT_SECRET_NAME.to_string()),
            namespace: Some(AGENT_SECRET_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

/// Runtime ID stored in an existing agent secret
fn runtime_id_from_secret(secret: &Secret) -> Option<String> {
    secret_value(secret, KEY_RUNTIME_ID)
}

async fn runtime_client(kubeconfig: &str) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| Error::configuration(format!("invalid runtime kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::configuration(format!("unusable runtime kubeconfig: {e}")))?;
    Client::try_from(config)
        .map_err(|e| Error::configuration(format!("failed to create runtime client: {e}")))
}

/// [`Configurator`] that writes the agent secret with server-side apply
pub struct RuntimeAgentConfigurator {
    registrant: Arc<dyn Registrant>,
    default_tenant: String,
}

impl RuntimeAgentConfigurator {
    /// Create a configurator that requests tokens through `registrant`
    ///
    /// `default_tenant` is used for runtimes without a global account, the
    /// same fallback the Director client applies on registration.
    pub fn new(registrant: Arc<dyn Registrant>, default_tenant: impl Into<String>) -> Self {
        Self {
            registrant,
            default_tenant: default_tenant.into(),
        }
    }

    async fn apply_secret(
        &self,
        client: Client,
        runtime_id: &str,
        tenant: &str,
    ) -> Result<(), Error> {
        let token = self
            .registrant
            .refresh_compass_token(runtime_id, tenant)
            .await?;

        let secret = build_agent_secret(runtime_id, tenant, &token);
        let secrets: Api<Secret> = Api::namespaced(client, AGENT_SECRET_NAMESPACE);
        secrets
            .patch(
                AGENT_SECRET_NAME,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| Error::configuration(format!("failed to apply agent secret: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl Configurator for RuntimeAgentConfigurator {
    async fn configure_compass_runtime_agent(
        &self,
        kubeconfig: &str,
        compass_runtime_id: &str,
        global_account: &str,
    ) -> Result<(), Error> {
        let client = runtime_client(kubeconfig).await?;
        let tenant = resolve_tenant(global_account, &self.default_tenant);
        self.apply_secret(client, compass_runtime_id, tenant).await?;

        info!(runtime_id = %compass_runtime_id, %tenant, "compass runtime agent configured");
        Ok(())
    }

    async fn update_compass_runtime_agent(&self, kubeconfig: &str) -> Result<(), Error> {
        let client = runtime_client(kubeconfig).await?;

        let secrets: Api<Secret> = Api::namespaced(client.clone(), AGENT_SECRET_NAMESPACE);
        let existing = secrets
            .get_opt(AGENT_SECRET_NAME)
            .await
            .map_err(|e| Error::configuration(format!("failed to read agent secret: {e}")))?
            .ok_or_else(|| Error::configuration("agent secret does not exist"))?;

        let runtime_id = runtime_id_from_secret(&existing)
            .ok_or_else(|| Error::configuration("agent secret carries no runtime ID"))?;

        let tenant = secret_value(&existing, KEY_TENANT)
            .unwrap_or_else(|| self.default_tenant.clone());

        debug!(runtime_id = %runtime_id, %tenant, "refreshing compass runtime agent token");
        self.apply_secret(client, &runtime_id, &tenant).await
    }
}
