//! Per-provisioner task state machine.

use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EngineError, EngineSettings, ErrorKind, Result};
use crate::provisioner::{
    ProvisionRequest, ProvisionResponse, ProvisionerBinding, ProvisionerError, StatusResponse,
};
use crate::schema::{Module, ResourceKind, RuntimeEvent};
use crate::utils::retry::PollSchedule;

/// Prefix of the failure message provisioners report for tokens they do not know.
pub const UNKNOWN_TOKEN_PREFIX: &str = "unknown token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// The work one provisioner binding does for one module.
pub struct Task {
    binding: Arc<ProvisionerBinding>,
    kinds: Vec<ResourceKind>,
    state: TaskState,
    token: Option<String>,
    attempts: u32,
    failure: Option<TaskFailure>,
}

impl Task {
    pub fn new(binding: Arc<ProvisionerBinding>, kinds: Vec<ResourceKind>) -> Self {
        Self {
            binding,
            kinds,
            state: TaskState::Pending,
            token: None,
            attempts: 0,
            failure: None,
        }
    }

    /// Resume a task that was already submitted under `token`.
    pub fn resume(binding: Arc<ProvisionerBinding>, kinds: Vec<ResourceKind>, token: String) -> Self {
        Self {
            state: TaskState::Running,
            token: Some(token),
            ..Self::new(binding, kinds)
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn provisioner_id(&self) -> &str {
        &self.binding.id
    }

    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Number of times `start` has been called.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!(
            provisioner = %self.binding.id,
            kind = ?kind,
            error = %message,
            "Task failed"
        );
        self.state = TaskState::Failed;
        self.token = None;
        self.failure = Some(TaskFailure { kind, message });
    }

    /// Submit the request to the bound provisioner.
    ///
    /// Moves to `Running` on submission, `Done` when there is nothing to do,
    /// and `Failed` when the call errors or exceeds its deadline.
    pub async fn start(&mut self, request: ProvisionRequest, settings: &EngineSettings) {
        self.attempts += 1;
        self.token = None;
        self.failure = None;
        let module = request.module_name.clone();

        match timeout(settings.call_timeout, self.binding.provisioner.provision(request)).await {
            Ok(Ok(ProvisionResponse::Submitted { token })) => {
                debug!(module = %module, provisioner = %self.binding.id, token = %token, "Task submitted");
                self.token = Some(token);
                self.state = TaskState::Running;
            }
            Ok(Ok(ProvisionResponse::NoChanges)) => {
                debug!(module = %module, provisioner = %self.binding.id, "No changes");
                self.state = TaskState::Done;
            }
            Ok(Err(err)) => {
                let kind = match &err {
                    ProvisionerError::UnsupportedKind { .. } => ErrorKind::UnsupportedKind,
                    ProvisionerError::InvalidSchema(_) => ErrorKind::InvalidSchema,
                    _ => ErrorKind::TransientIo,
                };
                self.fail(kind, err.to_string());
            }
            Err(_) => self.fail(
                ErrorKind::TransientIo,
                format!("provision call exceeded {:?}", settings.call_timeout),
            ),
        }
    }

    /// Poll the provisioner until the task reaches a terminal state.
    ///
    /// Returns the events of a successful task; failures are recorded on the
    /// task. Cancellation returns without touching the task's state.
    pub async fn progress(
        &mut self,
        desired: &Module,
        settings: &EngineSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<RuntimeEvent>> {
        let Some(token) = self.token.clone() else {
            self.fail(ErrorKind::UnknownToken, "task has no provisioning token");
            return Ok(Vec::new());
        };

        let mut schedule = PollSchedule::new(settings.poll_min, settings.poll_max);
        let mut transport_errors = 0u32;
        loop {
            let delay = schedule.next().unwrap_or(settings.poll_max);
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled(desired.name.clone())),
                _ = sleep(delay) => {}
            }

            let status = timeout(
                settings.call_timeout,
                self.binding.provisioner.status(&token, desired),
            )
            .await;
            match status {
                Ok(Ok(StatusResponse::Running)) => {
                    transport_errors = 0;
                }
                Ok(Ok(StatusResponse::Success { events })) => {
                    debug!(
                        module = %desired.name,
                        provisioner = %self.binding.id,
                        events = events.len(),
                        "Task done"
                    );
                    self.state = TaskState::Done;
                    self.token = None;
                    return Ok(events);
                }
                Ok(Ok(StatusResponse::Failed { message })) => {
                    let kind = if message.starts_with(UNKNOWN_TOKEN_PREFIX) {
                        ErrorKind::UnknownToken
                    } else {
                        ErrorKind::FatalProvisioner
                    };
                    self.fail(kind, message);
                    return Ok(Vec::new());
                }
                Ok(Err(err)) => {
                    transport_errors += 1;
                    if transport_errors > settings.max_task_retries {
                        self.fail(ErrorKind::TransientIo, err.to_string());
                        return Ok(Vec::new());
                    }
                    warn!(
                        module = %desired.name,
                        provisioner = %self.binding.id,
                        error = %err,
                        "Status poll failed, will poll again"
                    );
                }
                Err(_) => {
                    self.fail(
                        ErrorKind::TransientIo,
                        format!("status call exceeded {:?}", settings.call_timeout),
                    );
                    return Ok(Vec::new());
                }
            }
        }
    }
}
