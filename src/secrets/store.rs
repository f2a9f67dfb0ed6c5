//! Upstream secret stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Ref, Result, SecretsError};

/// A secret as listed by the upstream, without its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretListing {
    pub reference: Ref,
    pub last_changed: DateTime<Utc>,
}

/// The authoritative secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Secrets of `module` (and globals), or every secret when `module` is `None`.
    async fn list(&self, module: Option<&str>) -> Result<Vec<SecretListing>>;

    async fn load(&self, reference: &Ref) -> Result<Vec<u8>>;

    async fn store(&self, reference: &Ref, value: &[u8]) -> Result<()>;

    /// Deleting an absent secret succeeds.
    async fn delete(&self, reference: &Ref) -> Result<()>;
}

/// Secret store held in memory. Counts `load` calls.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<Ref, (Vec<u8>, DateTime<Utc>)>>,
    loads: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn list(&self, module: Option<&str>) -> Result<Vec<SecretListing>> {
        Ok(self
            .secrets
            .read()
            .await
            .iter()
            .filter(|(r, _)| match (module, &r.module) {
                (None, _) | (_, None) => true,
                (Some(wanted), Some(owner)) => wanted == owner,
            })
            .map(|(r, (_, changed))| SecretListing {
                reference: r.clone(),
                last_changed: *changed,
            })
            .collect())
    }

    async fn load(&self, reference: &Ref) -> Result<Vec<u8>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .read()
            .await
            .get(reference)
            .map(|(value, _)| value.clone())
            .ok_or_else(|| SecretsError::NotFound(reference.clone()))
    }

    async fn store(&self, reference: &Ref, value: &[u8]) -> Result<()> {
        self.secrets
            .write()
            .await
            .insert(reference.clone(), (value.to_vec(), Utc::now()));
        Ok(())
    }

    async fn delete(&self, reference: &Ref) -> Result<()> {
        self.secrets.write().await.remove(reference);
        Ok(())
    }
}
