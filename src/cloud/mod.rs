//! Cloud stack provisioner.
//!
//! Packages a module's resources into a declarative stack template, submits
//! an update operation and polls it. Outputs of a completed stack become
//! runtime events. Tokens are `<stack>/<operation>` so progress survives a
//! restart of this process.

mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provisioner::{
    changed_resources, ProvisionRequest, ProvisionResponse, Provisioner, ProvisionerError, Result,
    StatusResponse,
};
use crate::schema::{
    digest_of, get_provisioned, DatabaseConnections, DatabaseRuntimeEvent, Module, ResourceKind,
    ResourceSpec, RuntimeEvent, TopicRuntimeEvent,
};
use crate::utils::naming::to_lower_snake;

pub use memory::InMemoryStackClient;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("stack {0} not found")]
    StackNotFound(String),

    #[error("operation {operation} of stack {stack} not found")]
    OperationNotFound { stack: String, operation: String },

    #[error("stack backend error: {0}")]
    Backend(String),
}

/// One resource in a stack template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResource {
    pub kind: ResourceKind,
    pub spec: ResourceSpec,
}

/// Desired contents of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTemplate {
    pub resources: BTreeMap<String, StackResource>,
}

impl StackTemplate {
    pub fn hash(&self) -> String {
        digest_of(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    Complete { outputs: BTreeMap<String, String> },
    RolledBack { reason: String },
    Failed { reason: String },
}

/// A deployed stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub template_hash: String,
    pub outputs: BTreeMap<String, String>,
}

/// Cloud API managing stacks.
#[async_trait]
pub trait StackClient: Send + Sync {
    async fn describe(&self, stack: &str) -> std::result::Result<Option<StackDescription>, StackError>;

    /// Submit `template`, returning the operation id.
    async fn update(&self, stack: &str, template: &StackTemplate) -> std::result::Result<String, StackError>;

    async fn operation(&self, stack: &str, operation: &str)
        -> std::result::Result<OperationState, StackError>;
}

/// Stack holding `module`'s resources in `cluster_id`.
pub fn stack_name(cluster_id: &str, module: &str) -> String {
    format!("{}-{}", to_lower_snake(cluster_id), to_lower_snake(module)).replace('_', "-")
}

/// Runtime events for the resources of `module` found in `outputs`.
///
/// Databases publish `<id>.dsn` (and optionally `<id>.read_dsn`); topics
/// publish `<id>.topic_id` and a comma separated `<id>.brokers`.
pub fn events_from_outputs(
    module: &Module,
    kinds: &[ResourceKind],
    outputs: &BTreeMap<String, String>,
) -> Vec<RuntimeEvent> {
    let output = |id: &str, key: &str| outputs.get(&format!("{}.{}", id, key)).cloned();
    get_provisioned(module)
        .into_values()
        .filter(|r| kinds.contains(&r.kind))
        .filter_map(|resource| match resource.kind {
            ResourceKind::Postgres | ResourceKind::Mysql => {
                let write = output(&resource.resource_id, "dsn")?;
                let read = output(&resource.resource_id, "read_dsn").unwrap_or_else(|| write.clone());
                Some(RuntimeEvent::Database(DatabaseRuntimeEvent {
                    id: resource.resource_id,
                    connections: Some(DatabaseConnections { read, write }),
                    migration_digest: None,
                }))
            }
            ResourceKind::Topic => {
                let topic_id = output(&resource.resource_id, "topic_id")?;
                let brokers = output(&resource.resource_id, "brokers")
                    .map(|b| b.split(',').map(str::trim).map(str::to_string).collect())
                    .unwrap_or_default();
                Some(RuntimeEvent::Topic(TopicRuntimeEvent {
                    id: resource.resource_id,
                    topic_id,
                    brokers,
                }))
            }
            _ => None,
        })
        .collect()
}

/// Provisioner backed by a cloud stack per module.
pub struct CloudStackProvisioner {
    id: String,
    client: Arc<dyn StackClient>,
    kinds: Vec<ResourceKind>,
}

impl CloudStackProvisioner {
    pub fn new(id: impl Into<String>, client: Arc<dyn StackClient>, kinds: Vec<ResourceKind>) -> Self {
        Self {
            id: id.into(),
            client,
            kinds,
        }
    }

    fn template(&self, request: &ProvisionRequest) -> StackTemplate {
        let resources = get_provisioned(&request.desired_module)
            .into_values()
            .filter(|r| request.kinds.contains(&r.kind))
            .map(|r| {
                (
                    r.resource_id,
                    StackResource {
                        kind: r.kind,
                        spec: r.spec,
                    },
                )
            })
            .collect();
        StackTemplate { resources }
    }
}

fn backend(err: StackError) -> ProvisionerError {
    ProvisionerError::Transport(err.to_string())
}

#[async_trait]
impl Provisioner for CloudStackProvisioner {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    #[tracing::instrument(
        name = "cloud.provision",
        skip_all,
        fields(provisioner = %self.id, module = %request.module_name)
    )]
    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse> {
        let changes = changed_resources(&request);
        if let Some(change) = changes.iter().find(|c| !self.kinds.contains(&c.desired.kind)) {
            return Err(ProvisionerError::UnsupportedKind {
                provisioner: self.id.clone(),
                kind: change.desired.kind,
            });
        }
        if changes.is_empty() {
            return Ok(ProvisionResponse::NoChanges);
        }

        let stack = stack_name(&request.cluster_id, &request.module_name);
        let template = self.template(&request);
        let current = self.client.describe(&stack).await.map_err(backend)?;
        if current.is_some_and(|c| c.template_hash == template.hash()) {
            debug!(stack = %stack, "Stack template unchanged");
            return Ok(ProvisionResponse::NoChanges);
        }

        let operation = self.client.update(&stack, &template).await.map_err(backend)?;
        info!(stack = %stack, operation = %operation, resources = template.resources.len(), "Stack update submitted");
        Ok(ProvisionResponse::Submitted {
            token: format!("{}/{}", stack, operation),
        })
    }

    async fn status(&self, token: &str, desired_module: &Module) -> Result<StatusResponse> {
        let unknown = || StatusResponse::Failed {
            message: format!("unknown token: {}", token),
        };
        let Some((stack, operation)) = token.split_once('/') else {
            return Ok(unknown());
        };
        let state = match self.client.operation(stack, operation).await {
            Ok(state) => state,
            Err(StackError::OperationNotFound { .. }) | Err(StackError::StackNotFound(_)) => {
                return Ok(unknown())
            }
            Err(err) => return Err(backend(err)),
        };

        Ok(match state {
            OperationState::InProgress => StatusResponse::Running,
            OperationState::Complete { outputs } => StatusResponse::Success {
                events: events_from_outputs(desired_module, &self.kinds, &outputs),
            },
            OperationState::RolledBack { reason } => {
                warn!(stack = %stack, operation = %operation, reason = %reason, "Stack update rolled back");
                StatusResponse::Failed {
                    message: format!("stack {} rolled back: {}", stack, reason),
                }
            }
            OperationState::Failed { reason } => StatusResponse::Failed {
                message: format!("stack {} failed: {}", stack, reason),
            },
        })
    }
}

#[cfg(test)]
mod tests;
