//! Remote provisioner reached over HTTP.
//!
//! Speaks the same JSON contract the provisioner RPC server exposes:
//! `GET /v1/ping`, `POST /v1/provision`, `POST /v1/status`, `POST /v1/plan`.

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    PlanResponse, ProvisionRequest, ProvisionResponse, Provisioner, ProvisionerError, Result,
    StatusRequest, StatusResponse,
};
use crate::schema::Module;
use crate::utils::retry::rpc_backoff;

/// Remote provisioner configuration.
#[derive(Debug, Clone)]
pub struct PluginProvisionerConfig {
    /// Base URL of the plugin, e.g. `http://127.0.0.1:8894`.
    pub url: String,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for PluginProvisionerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl PluginProvisionerConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::Http(err) => err.is_timeout() || err.is_connect(),
            CallError::Unavailable(_) => true,
            CallError::Rejected(_) => false,
        }
    }
}

impl From<CallError> for ProvisionerError {
    fn from(err: CallError) -> Self {
        ProvisionerError::Transport(err.to_string())
    }
}

/// Provisioner plugin running out of process.
pub struct PluginProvisioner {
    id: String,
    client: Client,
    config: PluginProvisionerConfig,
}

impl PluginProvisioner {
    pub fn new(id: impl Into<String>, config: PluginProvisionerConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(ProvisionerError::Config("plugin url not configured".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProvisionerError::Transport(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            client,
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Determine if an HTTP status code is retryable.
    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, CallError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!(
            "HTTP {} - {}",
            status,
            body.chars().take(200).collect::<String>()
        );
        if Self::is_retryable_status(status) {
            Err(CallError::Unavailable(detail))
        } else {
            Err(CallError::Rejected(detail))
        }
    }

    async fn post_once<Req: Serialize + Sync, Resp: DeserializeOwned + Send>(
        &self,
        path: &str,
        body: &Req,
    ) -> std::result::Result<Resp, CallError> {
        let response = self.client.post(self.endpoint(path)).json(body).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json::<Resp>().await?)
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned + Send>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let result = (|| async { self.post_once(path, body).await })
            .retry(rpc_backoff())
            .when(CallError::is_retryable)
            .notify(|err, dur| {
                warn!(provisioner = %self.id, path, error = %err, delay = ?dur, "Plugin call failed, retrying");
            })
            .await?;
        debug!(provisioner = %self.id, path, "Plugin call succeeded");
        Ok(result)
    }
}

#[async_trait]
impl Provisioner for PluginProvisioner {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("/v1/ping"))
            .send()
            .await
            .map_err(CallError::from)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse> {
        self.post("/v1/provision", &request).await
    }

    async fn status(&self, token: &str, desired_module: &Module) -> Result<StatusResponse> {
        let request = StatusRequest {
            token: token.to_string(),
            desired_module: desired_module.clone(),
        };
        self.post("/v1/status", &request).await
    }

    async fn plan(&self, request: ProvisionRequest) -> Result<String> {
        let response: PlanResponse = self.post("/v1/plan", &request).await?;
        Ok(response.plan)
    }
}
