//! Schema event source.
//!
//! Publishes module additions, changes and removals to subscribers. A new
//! subscriber first receives the current state as a block of `Added` events
//! (`more` set on all but the last), then live changes in publication order.
//! Only the latest deployment of each module is kept.

mod remote;

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::schema::Module;

pub use remote::SchemaPuller;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("schema event source closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed schema event: {0}")]
    Decode(String),

    #[error("subscription cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Unspecified,
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_key: Option<String>,
    pub module_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Module>,
    /// More events of the initial batch follow.
    #[serde(default)]
    pub more: bool,
    pub change_type: ChangeType,
    /// The module itself is retired, not just one of its deployments.
    #[serde(default)]
    pub module_removed: bool,
}

impl SchemaEvent {
    fn carrying(module: &Module, change_type: ChangeType) -> Self {
        Self {
            deployment_key: module.deployment_key().map(str::to_string),
            module_name: module.name.clone(),
            module: Some(module.clone()),
            more: false,
            change_type,
            module_removed: false,
        }
    }

    /// Marks the end of an empty initial batch.
    pub fn end_of_batch() -> Self {
        Self {
            deployment_key: None,
            module_name: String::new(),
            module: None,
            more: false,
            change_type: ChangeType::Unspecified,
            module_removed: false,
        }
    }
}

fn recency(module: &Module) -> (DateTime<Utc>, &str) {
    (
        module.runtime.base.create_time,
        module.deployment_key().unwrap_or(""),
    )
}

/// Publisher of schema changes.
pub struct SchemaEventSource {
    state: RwLock<BTreeMap<String, Module>>,
    sender: broadcast::Sender<SchemaEvent>,
}

impl Default for SchemaEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaEventSource {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Source whose subscribers are dropped after falling `capacity` events behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            state: RwLock::new(BTreeMap::new()),
            sender,
        }
    }

    fn publish(&self, event: SchemaEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "Published schema event"),
            Err(_) => debug!("Published schema event (no receivers)"),
        }
    }

    /// Record `module` and publish `Added` or `Changed`.
    ///
    /// A deployment older than the one already held is ignored.
    pub async fn upsert(&self, module: Module) {
        let mut state = self.state.write().await;
        let change_type = match state.get(&module.name) {
            Some(current) if recency(&module).cmp(&recency(current)) == Ordering::Less => {
                debug!(
                    module = %module.name,
                    deployment_key = module.deployment_key().unwrap_or(""),
                    "Ignoring superseded deployment"
                );
                return;
            }
            Some(_) => ChangeType::Changed,
            None => ChangeType::Added,
        };
        let event = SchemaEvent::carrying(&module, change_type);
        state.insert(module.name.clone(), module);
        self.publish(event);
    }

    /// Drop `name` and publish `Removed`.
    pub async fn remove(&self, name: &str) {
        let mut state = self.state.write().await;
        let Some(module) = state.remove(name) else {
            return;
        };
        let mut event = SchemaEvent::carrying(&module, ChangeType::Removed);
        event.module_removed = true;
        info!(module = %name, "Module removed from schema");
        self.publish(event);
    }

    /// Latest deployment of every module.
    pub async fn snapshot(&self) -> Vec<Module> {
        self.state.read().await.values().cloned().collect()
    }

    /// Current state as a block of `Added` events, then live changes.
    pub async fn subscribe(&self) -> Subscription {
        let state = self.state.read().await;
        let receiver = self.sender.subscribe();
        let count = state.len();
        let initial = state
            .values()
            .enumerate()
            .map(|(i, module)| {
                let mut event = SchemaEvent::carrying(module, ChangeType::Added);
                event.more = i + 1 < count;
                event
            })
            .collect();
        Subscription { initial, receiver }
    }
}

/// One subscriber's view of the event source.
pub struct Subscription {
    initial: VecDeque<SchemaEvent>,
    receiver: broadcast::Receiver<SchemaEvent>,
}

impl Subscription {
    /// Events of the initial batch not yet received.
    pub fn initial_len(&self) -> usize {
        self.initial.len()
    }

    /// Next event. A subscriber that falls too far behind is dropped with `Lagged`.
    pub async fn next(&mut self) -> Result<SchemaEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Ok(event);
        }
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    /// Events as a stream ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<SchemaEvent>> + Send {
        futures::stream::unfold(Some(self), |subscription| async move {
            let mut subscription = subscription?;
            match subscription.next().await {
                Ok(event) => Some((Ok(event), Some(subscription))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests;
