//! Client materialising the schema from a remote `PullSchema` stream.

use std::collections::{BTreeMap, BTreeSet};

use backon::Retryable;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeType, Result, SchemaEvent, SubscriptionError, CHANNEL_CAPACITY};
use crate::schema::Module;
use crate::utils::retry::reconnect_backoff;

/// Pulls schema events from a remote source, reconnecting on failure.
///
/// Every connection starts with a fresh snapshot; modules absent from it are
/// dropped from the view. Events are re-broadcast locally with `more` latched
/// low once the first snapshot has been consumed.
pub struct SchemaPuller {
    client: Client,
    url: String,
    view: RwLock<BTreeMap<String, Module>>,
    synced: watch::Sender<bool>,
    sender: broadcast::Sender<SchemaEvent>,
}

impl SchemaPuller {
    /// `base_url` of the server exposing `/v1/schema/pull`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let (synced, _) = watch::channel(false);
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            client: Client::new(),
            url: format!("{}/v1/schema/pull", base_url.into().trim_end_matches('/')),
            view: RwLock::new(BTreeMap::new()),
            synced,
            sender,
        }
    }

    pub async fn module(&self, name: &str) -> Option<Module> {
        self.view.read().await.get(name).cloned()
    }

    pub async fn modules(&self) -> Vec<Module> {
        self.view.read().await.values().cloned().collect()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first snapshot has been consumed.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await.map(|_| ());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaEvent> {
        self.sender.subscribe()
    }

    /// Fold one event into the view.
    ///
    /// `batch` holds the names seen so far while a snapshot is in progress.
    pub(super) async fn apply(&self, mut event: SchemaEvent, batch: &mut Option<BTreeSet<String>>) {
        {
            let mut view = self.view.write().await;
            match event.change_type {
                ChangeType::Added | ChangeType::Changed => {
                    if let Some(module) = &event.module {
                        view.insert(event.module_name.clone(), module.clone());
                    }
                }
                ChangeType::Removed => {
                    view.remove(&event.module_name);
                }
                ChangeType::Unspecified => {}
            }

            if let Some(seen) = batch.as_mut() {
                if !event.module_name.is_empty() {
                    seen.insert(event.module_name.clone());
                }
                if !event.more {
                    view.retain(|name, _| seen.contains(name));
                    *batch = None;
                }
            }
        }

        let first_sync = batch.is_none() && !self.is_synced();
        if first_sync {
            self.synced.send_replace(true);
            info!(url = %self.url, "Initial schema sync complete");
        } else if self.is_synced() {
            event.more = false;
        }
        if event.change_type != ChangeType::Unspecified {
            let _ = self.sender.send(event);
        }
    }

    async fn pull_once(&self, cancel: &CancellationToken) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;
        debug!(url = %self.url, "Schema stream connected");

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut batch = Some(BTreeSet::new());
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(SubscriptionError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            let chunk = chunk.map_err(|e| SubscriptionError::Transport(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let event: SchemaEvent = serde_json::from_slice(line)
                    .map_err(|e| SubscriptionError::Decode(e.to_string()))?;
                self.apply(event, &mut batch).await;
            }
        }
    }

    /// Pull until `cancel` fires, reconnecting with backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let result = (|| async { self.pull_once(&cancel).await })
                .retry(reconnect_backoff())
                .when(|_| !cancel.is_cancelled())
                .notify(|err, dur| {
                    warn!(url = %self.url, error = %err, delay = ?dur, "Schema stream failed, reconnecting");
                })
                .await;
            match result {
                Ok(()) => debug!(url = %self.url, "Schema stream ended, reconnecting"),
                Err(SubscriptionError::Cancelled) => break,
                Err(err) => warn!(url = %self.url, error = %err, "Schema stream stopped"),
            }
        }
        info!(url = %self.url, "Schema puller stopped");
    }
}
