//! Provisioner contract.
//!
//! A provisioner owns a set of resource kinds. The engine asks it to
//! reconcile a module's resources with [`Provisioner::provision`], then polls
//! [`Provisioner::status`] with the returned token until the work finishes.
//! Successful tasks report the runtime events the engine folds back into the
//! module.

pub mod inmem;
mod noop;
mod plugin;
pub mod registry;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schema::{get_provisioned, Module, Provisioned, ResourceKind, RuntimeEvent, SchemaError};

pub use inmem::{HandlerContext, HandlerError, InMemProvisioner, ResourceHandler};
pub use noop::NoopProvisioner;
pub use registry::{PluginConfig, PluginEntry, ProvisionerBinding, ProvisionerRegistry};
pub use plugin::{PluginProvisioner, PluginProvisionerConfig};

/// Errors from provisioners and the registry.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("provisioner {provisioner} does not handle resource kind {kind}")]
    UnsupportedKind {
        provisioner: String,
        kind: ResourceKind,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(#[from] SchemaError),

    #[error("resource kind {kind} bound to both {first} and {second}")]
    DuplicateBinding {
        kind: ResourceKind,
        first: String,
        second: String,
    },

    #[error("unknown provisioner {0}: not builtin and no url configured")]
    UnknownProvisioner(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid plugin config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

/// Request to reconcile a module's resources of the given kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub cluster_id: String,
    pub module_name: String,
    pub desired_module: Module,
    #[serde(default)]
    pub previous_module: Option<Module>,
    pub kinds: Vec<ResourceKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionResponse {
    Submitted { token: String },
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Running,
    Failed { message: String },
    Success { events: Vec<RuntimeEvent> },
}

/// Wire form of a status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub token: String,
    pub desired_module: Module,
}

/// Wire form of a plan result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub plan: String,
}

/// A provisioning backend.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    /// Start reconciling the requested resources.
    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse>;

    /// Report progress of a task started by `provision`.
    ///
    /// Unknown tokens report `Failed`.
    async fn status(&self, token: &str, desired_module: &Module) -> Result<StatusResponse>;

    /// Describe what `provision` would do without doing it.
    async fn plan(&self, request: ProvisionRequest) -> Result<String> {
        Ok(describe_plan(&changed_resources(&request)))
    }
}

/// A resource whose desired state differs from its previous state.
#[derive(Debug, Clone)]
pub struct Change {
    pub desired: Provisioned,
    pub previous: Option<Provisioned>,
}

/// Resources of the requested kinds that are new or whose content changed.
pub fn changed_resources(request: &ProvisionRequest) -> Vec<Change> {
    let kinds: BTreeSet<ResourceKind> = request.kinds.iter().copied().collect();
    let desired = get_provisioned(&request.desired_module);
    let mut previous = request
        .previous_module
        .as_ref()
        .map(get_provisioned)
        .unwrap_or_default();

    desired
        .into_values()
        .filter(|resource| kinds.contains(&resource.kind))
        .filter_map(|resource| {
            let prior = previous.remove(&resource.resource_id);
            match prior {
                Some(prior) if prior == resource => None,
                prior => Some(Change {
                    desired: resource,
                    previous: prior,
                }),
            }
        })
        .collect()
}

/// One line per change: `create <kind> <id>` or `update <kind> <id>`.
pub fn describe_plan(changes: &[Change]) -> String {
    changes
        .iter()
        .map(|c| {
            let verb = if c.previous.is_some() {
                "update"
            } else {
                "create"
            };
            format!("{} {} {}", verb, c.desired.kind, c.desired.resource_id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
