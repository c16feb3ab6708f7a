//! Operator configuration
//!
//! Command line flags (each with an environment variable fallback) and the
//! Director credentials file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::Error;

/// Default namespace holding Kyma resources, kubeconfig secrets and mappings
pub const DEFAULT_NAMESPACE: &str = "kcp-system";

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Arguments of the `controller` subcommand
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Namespace watched for Kyma resources
    #[arg(long, env = "KYMA_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Delay before a waiting or failed Kyma is reconciled again
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value_t = 10)]
    pub requeue_interval_secs: u64,

    /// Upper bound on reconciles running at the same time
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 4)]
    pub max_concurrent_reconciles: usize,

    /// Path to the Director credentials file
    #[arg(long, env = "DIRECTOR_CONFIG_PATH")]
    pub director_config: PathBuf,

    /// Do not install the CompassManagerMapping CRD on startup
    #[arg(long)]
    pub skip_crd_install: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Requeue interval as a duration
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    /// Validate flag combinations clap cannot express
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::config("max concurrent reconciles must be at least 1"));
        }
        Ok(())
    }
}

/// OAuth2 client credentials for the Director
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Token endpoint
    pub token_url: String,
    /// Client ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Contents of the Director credentials file
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectorConfig {
    /// GraphQL endpoint of the Director
    pub url: String,
    /// OAuth2 credentials
    pub oauth: OAuthConfig,
    /// Tenant used when a Kyma carries no global account label
    pub default_tenant: String,
    /// Timeout of a single HTTP request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl DirectorConfig {
    /// Parse and validate a credentials document
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid director config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the credentials file at `path`
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("failed to read director config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), Error> {
        let required = [
            ("url", &self.url),
            ("oauth.tokenUrl", &self.oauth.token_url),
            ("oauth.clientId", &self.oauth.client_id),
            ("oauth.clientSecret", &self.oauth.client_secret),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config(format!("director config: {field} is required")));
            }
        }
        Ok(())
    }
}
