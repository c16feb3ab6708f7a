//! GraphQL client for the Compass Director
//!
//! Every call carries an OAuth2 client-credentials token and the `Tenant`
//! header of the global account that owns the runtime. Transport failures,
//! 5xx and 429 answers are retried a bounded number of times, GraphQL errors
//! are not.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{resolve_tenant, OneTimeToken, Registrant, RuntimeLabels};
use crate::config::DirectorConfig;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

const TENANT_HEADER: &str = "Tenant";

/// Tokens are refreshed this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

const RUNTIMES_BY_INSTANCE_QUERY: &str = r#"query ($filter: [LabelFilter!]) {
  result: runtimes(filter: $filter) { data { id name } }
}"#;

const REGISTER_RUNTIME_MUTATION: &str = r#"mutation ($in: RuntimeRegisterInput!) {
  result: registerRuntime(in: $in) { id }
}"#;

const REQUEST_TOKEN_MUTATION: &str = r#"mutation ($id: ID!) {
  result: requestOneTimeTokenForRuntime(id: $id) { token connectorURL }
}"#;

const UNREGISTER_RUNTIME_MUTATION: &str = r#"mutation ($id: ID!) {
  result: unregisterRuntime(id: $id) { id }
}"#;

/// Failure of a single round-trip, before retries are exhausted
#[derive(Debug)]
struct CallError {
    message: String,
    transient: bool,
}

impl CallError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    fn from_reqwest(context: &str, err: reqwest::Error) -> Self {
        let message = format!("{context}: {err}");
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }

    fn from_status(context: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{context} ({status}): {body}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::UNAUTHORIZED
        {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<ResultData<T>>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct ResultData<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

impl<T> GraphQlResponse<T> {
    /// Result field of the response, `None` if the Director returned null
    fn into_result(self) -> Result<Option<T>, Vec<String>> {
        if !self.errors.is_empty() {
            return Err(self.errors.into_iter().map(|e| e.message).collect());
        }
        Ok(self.data.and_then(|d| d.result))
    }
}

#[derive(Debug, Deserialize)]
struct RuntimePage {
    #[serde(default)]
    data: Vec<RuntimeRef>,
}

#[derive(Debug, Deserialize)]
struct RuntimeRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(response: TokenResponse, now: Instant) -> Self {
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(0))
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        Self {
            access_token: response.access_token,
            expires_at: now + lifetime,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

fn is_not_found(messages: &[String]) -> bool {
    messages.iter().any(|m| {
        let m = m.to_lowercase();
        m.contains("not found") || m.contains("does not exist")
    })
}

fn label_str<'a>(labels: &'a RuntimeLabels, key: &str) -> &'a str {
    labels.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn instance_filter(broker_instance_id: &str) -> Value {
    json!({
        "filter": [{
            "key": "broker_instance_id",
            "query": format!("$[*] ? (@ == {})", Value::from(broker_instance_id)),
        }]
    })
}

fn register_input(labels: &RuntimeLabels) -> Value {
    json!({
        "in": {
            "name": label_str(labels, "gardenerClusterName"),
            "description": format!("Kyma runtime {}", label_str(labels, "gardenerClusterName")),
            "labels": labels,
        }
    })
}

/// [`Registrant`] backed by the Director GraphQL API
pub struct DirectorClient {
    config: DirectorConfig,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
    retry: RetryConfig,
}

impl DirectorClient {
    /// Create a client for the Director described by `config`
    pub fn new(config: DirectorConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::config(format!("failed to build director http client: {e}")))?;

        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
            retry: RetryConfig::default(),
        })
    }

    /// Tenant for a global account, falling back to the configured default
    pub fn tenant_for<'a>(&'a self, global_account: &'a str) -> &'a str {
        resolve_tenant(global_account, &self.config.default_tenant)
    }

    async fn access_token(&self) -> Result<String, CallError> {
        let now = Instant::now();
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.config.oauth.token_url)
            .basic_auth(&self.config.oauth.client_id, Some(&self.config.oauth.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CallError::from_reqwest("token request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status("token request rejected", status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CallError::permanent(format!("invalid token response: {e}")))?;

        let cached = CachedToken::new(token, Instant::now());
        let access_token = cached.access_token.clone();
        *self.token.write().await = Some(cached);
        debug!("obtained director access token");
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    async fn round_trip<T: DeserializeOwned>(
        &self,
        tenant: &str,
        request: &GraphQlRequest<'_>,
    ) -> Result<GraphQlResponse<T>, CallError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(&self.config.url)
            .bearer_auth(token)
            .header(TENANT_HEADER, tenant)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest("director request failed", e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status("director request rejected", status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| CallError::permanent(format!("invalid director response: {e}")))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        tenant: &str,
        query: &str,
        variables: Value,
    ) -> Result<Result<Option<T>, Vec<String>>, Error> {
        let request = GraphQlRequest { query, variables };

        let response = retry_with_backoff(
            &self.retry,
            operation,
            |e: &CallError| e.transient,
            || self.round_trip::<T>(tenant, &request),
        )
        .await
        .map_err(|e| Error::director(format!("{operation}: {e}")))?;

        Ok(response.into_result())
    }

    async fn find_runtime(
        &self,
        tenant: &str,
        broker_instance_id: &str,
    ) -> Result<Option<String>, Error> {
        let page: Option<RuntimePage> = self
            .execute(
                "runtimes",
                tenant,
                RUNTIMES_BY_INSTANCE_QUERY,
                instance_filter(broker_instance_id),
            )
            .await?
            .map_err(|errors| Error::director(format!("runtimes: {}", errors.join("; "))))?;

        Ok(page.and_then(|p| p.data.into_iter().next()).map(|r| r.id))
    }
}

#[async_trait]
impl Registrant for DirectorClient {
    async fn register_in_compass(&self, labels: &RuntimeLabels) -> Result<String, Error> {
        let tenant = self.tenant_for(label_str(labels, "global_account_id"));
        let broker_instance_id = label_str(labels, "broker_instance_id");

        if !broker_instance_id.is_empty() {
            if let Some(id) = self.find_runtime(tenant, broker_instance_id).await? {
                info!(runtime_id = %id, %broker_instance_id, "runtime already registered");
                return Ok(id);
            }
        }

        let runtime: RuntimeRef = self
            .execute(
                "registerRuntime",
                tenant,
                REGISTER_RUNTIME_MUTATION,
                register_input(labels),
            )
            .await?
            .map_err(|errors| Error::director(format!("registerRuntime: {}", errors.join("; "))))?
            .ok_or_else(|| Error::director("registerRuntime: empty result"))?;

        info!(runtime_id = %runtime.id, %broker_instance_id, "runtime registered");
        Ok(runtime.id)
    }

    async fn refresh_compass_token(
        &self,
        compass_id: &str,
        global_account: &str,
    ) -> Result<OneTimeToken, Error> {
        self.execute(
            "requestOneTimeTokenForRuntime",
            self.tenant_for(global_account),
            REQUEST_TOKEN_MUTATION,
            json!({ "id": compass_id }),
        )
        .await?
        .map_err(|errors| {
            Error::director(format!("requestOneTimeTokenForRuntime: {}", errors.join("; ")))
        })?
        .ok_or_else(|| Error::director("requestOneTimeTokenForRuntime: empty result"))
    }

    async fn deregister_from_compass(
        &self,
        compass_id: &str,
        global_account: &str,
    ) -> Result<(), Error> {
        let result = self
            .execute::<RuntimeRef>(
                "unregisterRuntime",
                self.tenant_for(global_account),
                UNREGISTER_RUNTIME_MUTATION,
                json!({ "id": compass_id }),
            )
            .await?;

        match result {
            Ok(_) => {
                info!(runtime_id = %compass_id, "runtime unregistered");
                Ok(())
            }
            Err(errors) if is_not_found(&errors) => {
                debug!(runtime_id = %compass_id, "runtime already gone");
                Ok(())
            }
            Err(errors) => Err(Error::director(format!(
                "unregisterRuntime: {}",
                errors.join("; ")
            ))),
        }
    }
}
