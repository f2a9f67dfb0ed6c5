//! Named leases used for leader election.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::Result;

/// Leasing primitive. The holder string identifies the leader, typically its URL.
#[async_trait]
pub trait Leaser: Send + Sync {
    /// Acquire or renew `name` for `holder`. Returns whether `holder` now holds it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Current unexpired holder of `name`.
    async fn holder(&self, name: &str) -> Result<Option<String>>;

    /// Give up `name` if `holder` holds it.
    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

/// Leases shared between instances in one process.
#[derive(Default)]
pub struct InMemoryLeases {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Leaser for InMemoryLeases {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        let free = match leases.get(name) {
            Some((current, expires)) => current == holder || *expires <= now,
            None => true,
        };
        if free {
            leases.insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn holder(&self, name: &str) -> Result<Option<String>> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(name)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone()))
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|(current, _)| current == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}
