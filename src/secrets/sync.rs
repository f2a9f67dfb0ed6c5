//! Leader election and periodic sync of the secrets cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LeaderClient, LeaderConnector, Leaser, Ref, Result, SecretsCache, SecretsError};
use crate::config::SecretsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undecided,
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub lease_name: String,
    pub lease_ttl: Duration,
    pub leader_interval: Duration,
    pub follower_interval: Duration,
}

impl From<&SecretsConfig> for SyncSettings {
    fn from(config: &SecretsConfig) -> Self {
        Self {
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            leader_interval: Duration::from_secs(config.leader_sync_secs),
            follower_interval: Duration::from_secs(config.follower_sync_secs),
        }
    }
}

/// Keeps one cache in sync, as leader or follower.
///
/// The lease is renewed every third of its ttl. The leader refreshes from
/// upstream every `leader_interval`; followers copy the leader every
/// `follower_interval`. A failed sync is retried on the next renewal tick.
pub struct SecretsSync {
    cache: Arc<SecretsCache>,
    leases: Arc<dyn Leaser>,
    connector: Arc<dyn LeaderConnector>,
    identity: String,
    settings: SyncSettings,
    role: watch::Sender<Role>,
}

impl SecretsSync {
    /// `identity` is the URL followers use to reach this instance.
    pub fn new(
        cache: Arc<SecretsCache>,
        leases: Arc<dyn Leaser>,
        connector: Arc<dyn LeaderConnector>,
        identity: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        let (role, _) = watch::channel(Role::Undecided);
        Self {
            cache,
            leases,
            connector,
            identity: identity.into(),
            settings,
            role,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    async fn with_deadline<T>(
        interval: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = interval / 2;
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| SecretsError::Timeout(deadline))?
    }

    /// One refresh from the upstream store.
    pub async fn sync_as_leader(&self) -> Result<usize> {
        Self::with_deadline(self.settings.leader_interval, self.cache.sync_from_upstream()).await
    }

    /// One copy from the current leader.
    pub async fn sync_as_follower(&self) -> Result<usize> {
        let leader = self
            .leases
            .holder(&self.settings.lease_name)
            .await?
            .ok_or_else(|| SecretsError::Leader("no leader elected".to_string()))?;
        let client = self.connector.connect(&leader)?;
        let entries = Self::with_deadline(self.settings.follower_interval, client.list()).await?;
        let count = entries.len();
        self.cache.replace_all(entries);
        Ok(count)
    }

    /// Client for the lease holder, or `None` when this instance holds the
    /// lease or nobody does.
    async fn remote_leader(&self) -> Result<Option<Arc<dyn LeaderClient>>> {
        match self.leases.holder(&self.settings.lease_name).await? {
            Some(holder) if holder != self.identity => Ok(Some(self.connector.connect(&holder)?)),
            _ => Ok(None),
        }
    }

    /// Write a secret. Followers forward the write to the leader so that the
    /// next copy from it already carries the new value.
    pub async fn set(&self, reference: &Ref, value: &[u8]) -> Result<()> {
        match self.remote_leader().await? {
            Some(leader) => {
                leader.set(reference, value).await?;
                self.cache.record(reference, Some(value));
                Ok(())
            }
            None => self.cache.set(reference, value).await,
        }
    }

    pub async fn unset(&self, reference: &Ref) -> Result<()> {
        match self.remote_leader().await? {
            Some(leader) => {
                leader.unset(reference).await?;
                self.cache.record(reference, None);
                Ok(())
            }
            None => self.cache.unset(reference).await,
        }
    }

    pub fn cache(&self) -> &Arc<SecretsCache> {
        &self.cache
    }

    async fn elect(&self) -> Role {
        let acquired = self
            .leases
            .try_acquire(&self.settings.lease_name, &self.identity, self.settings.lease_ttl)
            .await;
        match acquired {
            Ok(true) => Role::Leader,
            Ok(false) => Role::Follower,
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "Lease check failed");
                Role::Follower
            }
        }
    }

    /// Run until `cancel` fires, then release the lease if held.
    pub async fn run(&self, cancel: CancellationToken) {
        let tick = (self.settings.lease_ttl / 3).max(Duration::from_millis(10));
        let mut next_sync = Instant::now();

        loop {
            let role = self.elect().await;
            let previous = self.role.send_replace(role);
            if previous != role {
                info!(identity = %self.identity, role = ?role, "Secrets sync role changed");
                next_sync = Instant::now();
            }

            if Instant::now() >= next_sync {
                let (result, interval) = match role {
                    Role::Leader => (self.sync_as_leader().await, self.settings.leader_interval),
                    _ => (self.sync_as_follower().await, self.settings.follower_interval),
                };
                match result {
                    Ok(count) => {
                        debug!(identity = %self.identity, role = ?role, count, "Secrets synced");
                        next_sync = Instant::now() + interval;
                    }
                    Err(err) => {
                        warn!(identity = %self.identity, role = ?role, error = %err, "Secrets sync failed");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
        }

        if self.role() == Role::Leader {
            let _ = self
                .leases
                .release(&self.settings.lease_name, &self.identity)
                .await;
        }
        info!(identity = %self.identity, "Secrets sync stopped");
    }
}
