//! A module deployment: ordered tasks converging one module.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::{Task, TaskState};
use super::{EngineError, EngineSettings, LogicalClock, Result};
use crate::provisioner::ProvisionRequest;
use crate::schema::{Module, RuntimeEvent};
use crate::utils::retry::retry_delay;

/// Task counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentState {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl DeploymentState {
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.running == 0 && self.failed == 0
    }
}

pub struct Deployment {
    cluster_id: String,
    module: Module,
    previous: Option<Module>,
    tasks: Vec<Task>,
    settings: EngineSettings,
    clock: Arc<LogicalClock>,
    cancel: CancellationToken,
    applied: Vec<RuntimeEvent>,
}

impl Deployment {
    /// Tasks run in the order given.
    pub fn new(
        cluster_id: impl Into<String>,
        module: Module,
        previous: Option<Module>,
        tasks: Vec<Task>,
        settings: EngineSettings,
        clock: Arc<LogicalClock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            module,
            previous,
            tasks,
            settings,
            clock,
            cancel,
            applied: Vec::new(),
        }
    }

    /// The module with every event applied so far.
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    pub fn previous(&self) -> Option<&Module> {
        self.previous.as_ref()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Events applied to the module, in application order.
    pub fn applied_events(&self) -> &[RuntimeEvent] {
        &self.applied
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> DeploymentState {
        let mut state = DeploymentState::default();
        for task in &self.tasks {
            match task.state() {
                TaskState::Pending => state.pending += 1,
                TaskState::Running => state.running += 1,
                TaskState::Done => state.done += 1,
                TaskState::Failed => state.failed += 1,
            }
        }
        state
    }

    fn request_for(&self, idx: usize) -> ProvisionRequest {
        ProvisionRequest {
            cluster_id: self.cluster_id.clone(),
            module_name: self.module.name.clone(),
            desired_module: self.module.clone(),
            previous_module: self.previous.clone(),
            kinds: self.tasks[idx].kinds().to_vec(),
        }
    }

    fn apply(&mut self, events: Vec<RuntimeEvent>) {
        for event in events {
            let clock = self.clock.tick();
            if self.module.apply_event(&event, clock) {
                debug!(module = %self.module.name, key = %event.key(), clock, "Applied runtime event");
            }
            self.applied.push(event);
        }
    }

    /// Advance the first unfinished task by one state step.
    ///
    /// Returns whether any task is still unfinished.
    pub async fn progress(&mut self) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(self.module.name.clone()));
        }
        let Some(idx) = self.tasks.iter().position(|t| t.state() != TaskState::Done) else {
            return Ok(false);
        };

        match self.tasks[idx].state() {
            TaskState::Pending => {
                let request = self.request_for(idx);
                let task = &mut self.tasks[idx];
                info!(
                    module = %self.module.name,
                    provisioner = %task.provisioner_id(),
                    kinds = ?task.kinds(),
                    "Starting task"
                );
                task.start(request, &self.settings).await;
            }
            TaskState::Running => {
                let task = &mut self.tasks[idx];
                let events = task
                    .progress(&self.module, &self.settings, &self.cancel)
                    .await?;
                if task.state() == TaskState::Done {
                    info!(
                        module = %self.module.name,
                        provisioner = %task.provisioner_id(),
                        events = events.len(),
                        "Task done"
                    );
                    self.apply(events);
                }
            }
            TaskState::Failed => {
                let task = &self.tasks[idx];
                let (kind, message) = task
                    .failure()
                    .map(|f| (f.kind, f.message.clone()))
                    .unwrap_or((super::ErrorKind::FatalProvisioner, "task failed".to_string()));
                if !kind.is_retryable() || task.attempts() > self.settings.max_task_retries {
                    error!(
                        module = %self.module.name,
                        provisioner = %task.provisioner_id(),
                        attempts = task.attempts(),
                        kind = ?kind,
                        error = %message,
                        "Deployment failed"
                    );
                    return Err(EngineError::TaskFailed {
                        module: self.module.name.clone(),
                        provisioner: task.provisioner_id().to_string(),
                        attempts: task.attempts(),
                        message,
                    });
                }

                let delay = retry_delay(
                    self.settings.poll_min,
                    self.settings.poll_max,
                    task.attempts().saturating_sub(1),
                );
                warn!(
                    module = %self.module.name,
                    provisioner = %task.provisioner_id(),
                    attempt = task.attempts(),
                    delay = ?delay,
                    error = %message,
                    "Retrying failed task"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(EngineError::Cancelled(self.module.name.clone()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                let request = self.request_for(idx);
                self.tasks[idx].start(request, &self.settings).await;
            }
            TaskState::Done => {}
        }

        Ok(self.tasks.iter().any(|t| t.state() != TaskState::Done))
    }

    /// Drive every task to completion.
    pub async fn run(&mut self) -> Result<()> {
        while self.progress().await? {}
        Ok(())
    }
}
