//! Retries terminations of superseded deployments.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RunnerScaling;

/// Deployments awaiting termination, retried until the backend confirms.
pub struct TerminationSweeper {
    scaling: Arc<dyn RunnerScaling>,
    pending: DashMap<(String, String), u32>,
    interval: Duration,
}

impl TerminationSweeper {
    pub fn new(scaling: Arc<dyn RunnerScaling>, interval: Duration) -> Self {
        Self {
            scaling,
            pending: DashMap::new(),
            interval,
        }
    }

    /// Queue `deployment_key` of `module` for termination.
    pub fn schedule(&self, module: &str, deployment_key: &str) {
        debug!(module = %module, deployment_key = %deployment_key, "Scheduling termination");
        self.pending
            .entry((module.to_string(), deployment_key.to_string()))
            .or_insert(0);
    }

    pub fn pending(&self) -> Vec<(String, String)> {
        let mut pending: Vec<_> = self.pending.iter().map(|e| e.key().clone()).collect();
        pending.sort();
        pending
    }

    /// Attempt every pending termination once. Returns how many succeeded.
    pub async fn sweep(&self) -> usize {
        let mut terminated = 0;
        for (module, key) in self.pending() {
            match self.scaling.terminate_deployment(&module, &key).await {
                Ok(()) => {
                    self.pending.remove(&(module.clone(), key.clone()));
                    info!(module = %module, deployment_key = %key, "Swept deployment");
                    terminated += 1;
                }
                Err(err) => {
                    let attempts = self
                        .pending
                        .get_mut(&(module.clone(), key.clone()))
                        .map(|mut a| {
                            *a += 1;
                            *a
                        })
                        .unwrap_or(0);
                    warn!(module = %module, deployment_key = %key, attempts, error = %err, "Termination failed");
                }
            }
        }
        terminated
    }

    /// Sweep on every interval tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.sweep().await;
                    }
                }
            }
        }
        debug!("Termination sweeper stopped");
    }
}
