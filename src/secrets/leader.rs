//! Secrets RPC between followers and the leader.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Ref, Result, SecretsCache, SecretsError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsListRequest {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub include_values: bool,
}

/// One listed secret. `value` is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub ref_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SecretEntry {
    pub fn new(reference: &Ref, value: Option<&[u8]>) -> Self {
        Self {
            ref_path: reference.to_string(),
            value: value.map(|v| STANDARD.encode(v)),
        }
    }

    pub fn decode(&self) -> Result<(Ref, Option<Vec<u8>>)> {
        let reference = self.ref_path.parse()?;
        let value = self
            .value
            .as_ref()
            .map(|v| STANDARD.decode(v))
            .transpose()
            .map_err(|e| SecretsError::Leader(format!("{}: {}", self.ref_path, e)))?;
        Ok((reference, value))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsListResponse {
    pub secrets: Vec<SecretEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSetRequest {
    pub provider: String,
    pub ref_path: String,
    /// Base64 encoded value.
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretUnsetRequest {
    pub provider: String,
    pub ref_path: String,
}

/// Connection to the current leader.
#[async_trait]
pub trait LeaderClient: Send + Sync {
    /// Every secret the leader holds, with values.
    async fn list(&self) -> Result<Vec<(Ref, Vec<u8>)>>;

    /// Write through the leader, which stores upstream and updates its cache.
    async fn set(&self, reference: &Ref, value: &[u8]) -> Result<()>;

    async fn unset(&self, reference: &Ref) -> Result<()>;
}

/// Opens a client for the leader at a URL.
pub trait LeaderConnector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn LeaderClient>>;
}

/// Leader reached over HTTP at `<url>/v1/secrets/*`.
pub struct HttpLeaderClient {
    client: Client,
    url: String,
    provider: String,
}

impl HttpLeaderClient {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/secrets/{}", self.url, path)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        self.client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SecretsError::Leader(e.to_string()))
    }
}

#[async_trait]
impl LeaderClient for HttpLeaderClient {
    async fn list(&self) -> Result<Vec<(Ref, Vec<u8>)>> {
        let request = SecretsListRequest {
            module: None,
            include_values: true,
        };
        let response: SecretsListResponse = self
            .post("list", &request)
            .await?
            .json()
            .await
            .map_err(|e| SecretsError::Leader(e.to_string()))?;

        response
            .secrets
            .iter()
            .map(|entry| {
                let (reference, value) = entry.decode()?;
                Ok((reference, value.unwrap_or_default()))
            })
            .collect()
    }

    async fn set(&self, reference: &Ref, value: &[u8]) -> Result<()> {
        let request = SecretSetRequest {
            provider: self.provider.clone(),
            ref_path: reference.to_string(),
            value: STANDARD.encode(value),
        };
        self.post("set", &request).await.map(|_| ())
    }

    async fn unset(&self, reference: &Ref) -> Result<()> {
        let request = SecretUnsetRequest {
            provider: self.provider.clone(),
            ref_path: reference.to_string(),
        };
        self.post("unset", &request).await.map(|_| ())
    }
}

/// Connects to leaders serving the secrets of `provider`.
pub struct HttpLeaderConnector {
    client: Client,
    provider: String,
}

impl HttpLeaderConnector {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            provider: provider.into(),
        }
    }
}

impl LeaderConnector for HttpLeaderConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn LeaderClient>> {
        Ok(Arc::new(HttpLeaderClient {
            client: self.client.clone(),
            url: url.trim_end_matches('/').to_string(),
            provider: self.provider.clone(),
        }))
    }
}

/// Leader running in this process.
pub struct LocalLeaderClient {
    cache: Arc<SecretsCache>,
}

impl LocalLeaderClient {
    pub fn new(cache: Arc<SecretsCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl LeaderClient for LocalLeaderClient {
    async fn list(&self) -> Result<Vec<(Ref, Vec<u8>)>> {
        if !self.cache.is_loaded() {
            return Err(SecretsError::NotLoaded);
        }
        Ok(self.cache.list(None))
    }

    async fn set(&self, reference: &Ref, value: &[u8]) -> Result<()> {
        self.cache.set(reference, value).await
    }

    async fn unset(&self, reference: &Ref) -> Result<()> {
        self.cache.unset(reference).await
    }
}

/// Caches of in-process instances by URL.
#[derive(Default)]
pub struct LocalLeaderConnector {
    caches: RwLock<HashMap<String, Arc<SecretsCache>>>,
}

impl LocalLeaderConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: impl Into<String>, cache: Arc<SecretsCache>) {
        if let Ok(mut caches) = self.caches.write() {
            caches.insert(url.into(), cache);
        }
    }

    pub fn unregister(&self, url: &str) {
        if let Ok(mut caches) = self.caches.write() {
            caches.remove(url);
        }
    }
}

impl LeaderConnector for LocalLeaderConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn LeaderClient>> {
        let cache = self
            .caches
            .read()
            .ok()
            .and_then(|c| c.get(url).cloned())
            .ok_or_else(|| SecretsError::Leader(format!("no leader at {}", url)))?;
        Ok(Arc::new(LocalLeaderClient::new(cache)))
    }
}
