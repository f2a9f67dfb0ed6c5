//! Process-local read cache of secrets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::{Ref, Result, SecretStore, SecretsError};

/// Channel capacity for cache update broadcasts.
const CHANNEL_CAPACITY: usize = 1024;

/// A change to one cached secret. `value` is `None` when it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretUpdate {
    pub reference: Ref,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Cached {
    value: Vec<u8>,
    last_changed: DateTime<Utc>,
}

/// Cache of one secrets provider.
pub struct SecretsCache {
    provider: String,
    upstream: Arc<dyn SecretStore>,
    secrets: DashMap<Ref, Cached>,
    loaded: watch::Sender<bool>,
    load_timeout: Duration,
    updates: broadcast::Sender<SecretUpdate>,
}

impl SecretsCache {
    pub fn new(provider: impl Into<String>, upstream: Arc<dyn SecretStore>, load_timeout: Duration) -> Self {
        let (loaded, _) = watch::channel(false);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            provider: provider.into(),
            upstream,
            secrets: DashMap::new(),
            loaded,
            load_timeout,
            updates,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecretUpdate> {
        self.updates.subscribe()
    }

    async fn wait_loaded(&self) {
        if self.is_loaded() {
            return;
        }
        let mut rx = self.loaded.subscribe();
        let waited = tokio::time::timeout(self.load_timeout, async {
            rx.wait_for(|loaded| *loaded).await.map(|_| ())
        })
        .await;
        if waited.is_err() {
            warn!(provider = %self.provider, timeout = ?self.load_timeout, "Secrets not loaded in time");
        }
    }

    /// Value of `reference`, waiting up to the load timeout for the first sync.
    pub async fn get(&self, reference: &Ref) -> Result<Vec<u8>> {
        self.wait_loaded().await;
        self.secrets
            .get(reference)
            .map(|c| c.value.clone())
            .ok_or_else(|| SecretsError::NotFound(reference.clone()))
    }

    /// Cached secrets of `module` (and globals), or all when `module` is `None`.
    pub fn list(&self, module: Option<&str>) -> Vec<(Ref, Vec<u8>)> {
        let mut out: Vec<(Ref, Vec<u8>)> = self
            .secrets
            .iter()
            .filter(|e| match (module, &e.key().module) {
                (None, _) | (_, None) => true,
                (Some(wanted), Some(owner)) => wanted == owner,
            })
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Write upstream, then update the cache.
    pub async fn set(&self, reference: &Ref, value: &[u8]) -> Result<()> {
        self.upstream.store(reference, value).await?;
        self.put(reference.clone(), value.to_vec(), Utc::now());
        Ok(())
    }

    /// Delete upstream, then from the cache.
    pub async fn unset(&self, reference: &Ref) -> Result<()> {
        self.upstream.delete(reference).await?;
        self.evict(reference);
        Ok(())
    }

    /// Apply a write already made upstream by another instance.
    pub fn record(&self, reference: &Ref, value: Option<&[u8]>) {
        match value {
            Some(value) => self.put(reference.clone(), value.to_vec(), Utc::now()),
            None => self.evict(reference),
        }
    }

    fn put(&self, reference: Ref, value: Vec<u8>, last_changed: DateTime<Utc>) {
        let changed = self
            .secrets
            .get(&reference)
            .map_or(true, |c| c.value != value);
        self.secrets.insert(
            reference.clone(),
            Cached {
                value: value.clone(),
                last_changed,
            },
        );
        if changed {
            let _ = self.updates.send(SecretUpdate {
                reference,
                value: Some(value),
            });
        }
    }

    fn evict(&self, reference: &Ref) {
        if self.secrets.remove(reference).is_some() {
            let _ = self.updates.send(SecretUpdate {
                reference: reference.clone(),
                value: None,
            });
        }
    }

    fn mark_loaded(&self) {
        if !self.is_loaded() {
            debug!(provider = %self.provider, "Secrets loaded");
            self.loaded.send_replace(true);
        }
    }

    /// Refresh from the upstream, fetching only secrets changed since cached.
    ///
    /// Returns the number of values fetched.
    pub async fn sync_from_upstream(&self) -> Result<usize> {
        let listings = self.upstream.list(None).await?;
        let listed: BTreeSet<Ref> = listings.iter().map(|l| l.reference.clone()).collect();
        let mut fetched = 0;
        for listing in listings {
            let stale = self
                .secrets
                .get(&listing.reference)
                .map_or(true, |c| c.last_changed < listing.last_changed);
            if !stale {
                continue;
            }
            match self.upstream.load(&listing.reference).await {
                Ok(value) => {
                    self.put(listing.reference, value, listing.last_changed);
                    fetched += 1;
                }
                // Deleted between list and load.
                Err(SecretsError::NotFound(_)) => self.evict(&listing.reference),
                Err(err) => return Err(err),
            }
        }
        self.evict_unlisted(&listed);
        self.mark_loaded();
        Ok(fetched)
    }

    /// Replace the cache with a full copy taken from the leader.
    pub fn replace_all(&self, entries: Vec<(Ref, Vec<u8>)>) {
        let listed: BTreeSet<Ref> = entries.iter().map(|(r, _)| r.clone()).collect();
        let now = Utc::now();
        for (reference, value) in entries {
            self.put(reference, value, now);
        }
        self.evict_unlisted(&listed);
        self.mark_loaded();
    }

    fn evict_unlisted(&self, listed: &BTreeSet<Ref>) {
        let gone: Vec<Ref> = self
            .secrets
            .iter()
            .map(|e| e.key().clone())
            .filter(|r| !listed.contains(r))
            .collect();
        for reference in gone {
            self.evict(&reference);
        }
    }
}
