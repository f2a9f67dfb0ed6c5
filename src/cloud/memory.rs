//! Stack client simulating a cloud API in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{OperationState, StackClient, StackDescription, StackError, StackTemplate};
use crate::schema::ResourceKind;

struct Operation {
    template: StackTemplate,
    polls_left: u32,
    failure: Option<String>,
    finished: Option<OperationState>,
}

/// Stacks complete after a configurable number of polls.
///
/// Databases get `<id>.dsn = <engine>://cloud.internal/<stack>/<id>`; topics
/// get `<id>.topic_id = <stack>.<id>`.
#[derive(Default)]
pub struct InMemoryStackClient {
    stacks: RwLock<HashMap<String, StackDescription>>,
    operations: RwLock<HashMap<(String, String), Operation>>,
    polls: u32,
    fail_next: RwLock<Option<String>>,
    counter: AtomicU64,
}

impl InMemoryStackClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations report `InProgress` for `polls` polls before finishing.
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls = polls;
        self
    }

    /// Roll back the next submitted operation with `reason`.
    pub async fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.write().await = Some(reason.into());
    }

    pub async fn stack(&self, stack: &str) -> Option<StackDescription> {
        self.stacks.read().await.get(stack).cloned()
    }

    fn outputs(stack: &str, template: &StackTemplate) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        for (id, resource) in &template.resources {
            match resource.kind {
                ResourceKind::Postgres | ResourceKind::Mysql => {
                    outputs.insert(
                        format!("{}.dsn", id),
                        format!("{}://cloud.internal/{}/{}", resource.kind, stack, id),
                    );
                }
                ResourceKind::Topic => {
                    outputs.insert(format!("{}.topic_id", id), format!("{}.{}", stack, id));
                }
                _ => {}
            }
        }
        outputs
    }
}

#[async_trait]
impl StackClient for InMemoryStackClient {
    async fn describe(&self, stack: &str) -> Result<Option<StackDescription>, StackError> {
        Ok(self.stacks.read().await.get(stack).cloned())
    }

    async fn update(&self, stack: &str, template: &StackTemplate) -> Result<String, StackError> {
        let operation = format!("op-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        let failure = self.fail_next.write().await.take();
        self.operations.write().await.insert(
            (stack.to_string(), operation.clone()),
            Operation {
                template: template.clone(),
                polls_left: self.polls,
                failure,
                finished: None,
            },
        );
        Ok(operation)
    }

    async fn operation(&self, stack: &str, operation: &str) -> Result<OperationState, StackError> {
        let mut operations = self.operations.write().await;
        let op = operations
            .get_mut(&(stack.to_string(), operation.to_string()))
            .ok_or_else(|| StackError::OperationNotFound {
                stack: stack.to_string(),
                operation: operation.to_string(),
            })?;
        if let Some(finished) = &op.finished {
            return Ok(finished.clone());
        }
        if op.polls_left > 0 {
            op.polls_left -= 1;
            return Ok(OperationState::InProgress);
        }

        let state = match &op.failure {
            Some(reason) => OperationState::RolledBack {
                reason: reason.clone(),
            },
            None => {
                let outputs = Self::outputs(stack, &op.template);
                self.stacks.write().await.insert(
                    stack.to_string(),
                    StackDescription {
                        template_hash: op.template.hash(),
                        outputs: outputs.clone(),
                    },
                );
                OperationState::Complete { outputs }
            }
        };
        op.finished = Some(state.clone());
        Ok(state)
    }
}
