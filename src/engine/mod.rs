//! Deployment engine.
//!
//! For each module being (re)deployed the engine builds a [`Deployment`]
//! holding one [`Task`] per provisioner binding, drives the tasks to
//! completion in dependency order, folds the emitted runtime events into the
//! module, and publishes the result as the new observed schema.

mod deployment;
mod service;
mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::provisioner::ProvisionerError;
use crate::schema::SchemaError;

pub use deployment::{Deployment, DeploymentState};
pub use service::{DeployOutcome, Engine};
pub use task::{Task, TaskFailure, TaskState};

/// Semantic classification of a failure, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidSchema,
    UnsupportedKind,
    UnknownToken,
    TransientIo,
    ResourceBusy,
    FatalProvisioner,
    Cancelled,
    ArtefactMissing,
    DependencyUnsatisfied,
}

impl ErrorKind {
    /// Whether a failed task of this kind may be restarted.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::InvalidSchema | ErrorKind::UnsupportedKind | ErrorKind::Cancelled
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid schema: {0}")]
    InvalidSchema(#[from] SchemaError),

    #[error(transparent)]
    Provisioner(#[from] ProvisionerError),

    #[error("task {provisioner} for module {module} failed after {attempts} attempts: {message}")]
    TaskFailed {
        module: String,
        provisioner: String,
        attempts: u32,
        message: String,
    },

    #[error("deployment of {0} cancelled")]
    Cancelled(String),

    #[error("module {0} not found")]
    ModuleNotFound(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidSchema(_) => ErrorKind::InvalidSchema,
            EngineError::Provisioner(ProvisionerError::UnsupportedKind { .. }) => {
                ErrorKind::UnsupportedKind
            }
            EngineError::Provisioner(ProvisionerError::InvalidSchema(_)) => {
                ErrorKind::InvalidSchema
            }
            EngineError::Provisioner(_) => ErrorKind::TransientIo,
            EngineError::TaskFailed { .. } => ErrorKind::FatalProvisioner,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::ModuleNotFound(_) => ErrorKind::InvalidSchema,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Tunables for task polling and retry.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Restarts of a failed task before the deployment fails.
    pub max_task_retries: u32,
    /// Deadline for each provisioner call.
    pub call_timeout: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            call_timeout: Duration::from_secs(300),
            poll_min: Duration::from_millis(50),
            poll_max: Duration::from_secs(30),
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_task_retries: config.max_task_retries,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            poll_min: Duration::from_millis(config.poll_min_delay_ms),
            poll_max: Duration::from_millis(config.poll_max_delay_ms),
        }
    }
}

/// Monotonic clock stamping runtime events.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the new time.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests;
