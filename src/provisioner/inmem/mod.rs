//! In-process provisioner driven by per-kind resource handlers.
//!
//! `provision` diffs the desired module against the previous one, spawns a
//! step per changed resource and hands back a token. Steps of one token run
//! concurrently; a step whose dependencies are provisioned by the same token
//! waits for them and sees their runtime events applied to its module.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    changed_resources, ProvisionRequest, ProvisionResponse, Provisioner, ProvisionerError, Result,
    StatusResponse,
};
use crate::engine::ErrorKind;
use crate::schema::{
    digest_of, get_provisioned, Module, Provisioned, ResourceKind, ResourceRef, RuntimeEvent,
};

/// Errors a resource handler reports for its step.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid dependencies for {resource}: {reason}")]
    InvalidDependencies { resource: String, reason: String },

    #[error("artefact {0} missing")]
    ArtefactMissing(String),

    #[error("dependency {0} has not been provisioned")]
    DependencyUnsatisfied(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("scaling error: {0}")]
    Scaling(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::ArtefactMissing(_) => ErrorKind::ArtefactMissing,
            HandlerError::DependencyUnsatisfied(_) => ErrorKind::DependencyUnsatisfied,
            HandlerError::Transient(_) => ErrorKind::TransientIo,
            HandlerError::Cancelled => ErrorKind::Cancelled,
            HandlerError::InvalidDependencies { .. }
            | HandlerError::Database(_)
            | HandlerError::Archive(_)
            | HandlerError::Scaling(_) => ErrorKind::FatalProvisioner,
        }
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                HandlerError::Transient(err.to_string())
            }
            other => HandlerError::Database(other.to_string()),
        }
    }
}

/// What a handler sees of the deployment it runs in.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub cluster_id: String,
    /// Desired module, with events of finished sibling steps applied.
    pub module: Module,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn module_name(&self) -> &str {
        &self.module.name
    }

    /// The dependency as currently provisioned, outputs included.
    pub fn dependency(&self, reference: &ResourceRef) -> Option<Provisioned> {
        get_provisioned(&self.module)
            .remove(&reference.id)
            .filter(|r| r.kind == reference.kind)
    }
}

/// Provisions resources of one kind.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Create or update `resource`, returning the runtime event describing the result.
    async fn provision(
        &self,
        ctx: &HandlerContext,
        resource: &Provisioned,
        previous: Option<&Provisioned>,
    ) -> std::result::Result<Option<RuntimeEvent>, HandlerError>;
}

struct Step {
    resource_id: String,
    kind: ResourceKind,
    done: watch::Sender<bool>,
    error: Mutex<Option<String>>,
}

impl Step {
    fn new(resource: &Provisioned) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            resource_id: resource.resource_id.clone(),
            kind: resource.kind,
            done,
            error: Mutex::new(None),
        }
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    fn finish(&self, error: Option<String>) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = error;
        }
        self.done.send_replace(true);
    }
}

struct InMemTask {
    key: (String, String),
    steps: Vec<Arc<Step>>,
    events: Arc<Mutex<Vec<RuntimeEvent>>>,
    cancel: CancellationToken,
}

/// Provisioner running resource handlers in this process.
pub struct InMemProvisioner {
    id: String,
    handlers: HashMap<ResourceKind, Arc<dyn ResourceHandler>>,
    tasks: Arc<DashMap<String, Arc<InMemTask>>>,
    inflight: Arc<DashMap<(String, String), String>>,
    cancel: CancellationToken,
}

impl InMemProvisioner {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handlers: HashMap::new(),
            tasks: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_handler(mut self, kind: ResourceKind, handler: Arc<dyn ResourceHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Parent every task's cancellation scope to `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Number of tokens not yet reported terminal.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn forget(&self, token: &str) {
        if let Some((_, task)) = self.tasks.remove(token) {
            task.cancel.cancel();
            self.inflight
                .remove_if(&task.key, |_, inflight| inflight.as_str() == token);
        }
    }

    fn spawn_step(
        &self,
        step: Arc<Step>,
        waits_on: Vec<watch::Receiver<bool>>,
        dependencies: Vec<Arc<Step>>,
        handler: Arc<dyn ResourceHandler>,
        resource: Provisioned,
        previous: Option<Provisioned>,
        base: HandlerContext,
        events: Arc<Mutex<Vec<RuntimeEvent>>>,
    ) {
        let provisioner = self.id.clone();
        tokio::spawn(async move {
            let cancel = base.cancel.clone();
            let run = async {
                for mut rx in waits_on {
                    let ready = rx.wait_for(|done| *done).await.map(|_| ());
                    if ready.is_err() {
                        return Err(HandlerError::Cancelled);
                    }
                }
                if let Some(failed) = dependencies.iter().find(|d| d.error().is_some()) {
                    return Err(HandlerError::DependencyUnsatisfied(failed.resource_id.clone()));
                }

                let mut ctx = base;
                let sibling_events = events.lock().map(|e| e.clone()).unwrap_or_default();
                apply_local(&mut ctx.module, &sibling_events);
                handler.provision(&ctx, &resource, previous.as_ref()).await
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(HandlerError::Cancelled),
                outcome = run => outcome,
            };

            match outcome {
                Ok(event) => {
                    if let Some(event) = event {
                        if let Ok(mut events) = events.lock() {
                            events.push(event);
                        }
                    }
                    debug!(provisioner = %provisioner, resource_id = %step.resource_id, kind = %step.kind, "Step done");
                    step.finish(None);
                }
                Err(err) => {
                    warn!(
                        provisioner = %provisioner,
                        resource_id = %step.resource_id,
                        kind = %step.kind,
                        error_kind = ?err.kind(),
                        error = %err,
                        "Step failed"
                    );
                    step.finish(Some(err.to_string()));
                }
            }
        });
    }
}

/// Fold `events` into a local view of `module`, newer than anything it holds.
fn apply_local(module: &mut Module, events: &[RuntimeEvent]) {
    let mut clock = module.runtime.clocks.values().copied().max().unwrap_or(0);
    for event in events {
        clock += 1;
        module.apply_event(event, clock);
    }
}

#[async_trait]
impl Provisioner for InMemProvisioner {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    #[tracing::instrument(
        name = "inmem.provision",
        skip_all,
        fields(provisioner = %self.id, module = %request.module_name)
    )]
    async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse> {
        let changes = changed_resources(&request);
        for change in &changes {
            if !self.handlers.contains_key(&change.desired.kind) {
                return Err(ProvisionerError::UnsupportedKind {
                    provisioner: self.id.clone(),
                    kind: change.desired.kind,
                });
            }
        }
        if changes.is_empty() {
            return Ok(ProvisionResponse::NoChanges);
        }

        let resources: BTreeMap<&str, &Provisioned> = changes
            .iter()
            .map(|c| (c.desired.resource_id.as_str(), &c.desired))
            .collect();
        let key = (
            request.module_name.clone(),
            digest_of(&(&resources, &request.kinds)),
        );
        if let Some(token) = self.inflight.get(&key) {
            if self.tasks.contains_key(token.value()) {
                debug!(token = %token.value(), "Returning in-flight token");
                return Ok(ProvisionResponse::Submitted {
                    token: token.value().clone(),
                });
            }
        }

        let token = Uuid::new_v4().to_string();
        let cancel = self.cancel.child_token();
        let events = Arc::new(Mutex::new(Vec::new()));
        let steps: BTreeMap<String, Arc<Step>> = changes
            .iter()
            .map(|c| (c.desired.resource_id.clone(), Arc::new(Step::new(&c.desired))))
            .collect();

        let base = HandlerContext {
            cluster_id: request.cluster_id.clone(),
            module: request.desired_module.clone(),
            cancel: cancel.clone(),
        };
        for change in changes {
            let Some(handler) = self.handlers.get(&change.desired.kind).cloned() else {
                continue;
            };
            let Some(step) = steps.get(&change.desired.resource_id).cloned() else {
                continue;
            };
            let dependencies: Vec<Arc<Step>> = change
                .desired
                .dependencies
                .iter()
                .filter_map(|d| steps.get(&d.id).cloned())
                .collect();
            let waits_on = dependencies.iter().map(|d| d.done.subscribe()).collect();
            self.spawn_step(
                step,
                waits_on,
                dependencies,
                handler,
                change.desired,
                change.previous,
                base.clone(),
                events.clone(),
            );
        }

        info!(token = %token, steps = steps.len(), "Provisioning submitted");
        self.tasks.insert(
            token.clone(),
            Arc::new(InMemTask {
                key: key.clone(),
                steps: steps.into_values().collect(),
                events,
                cancel,
            }),
        );
        self.inflight.insert(key, token.clone());
        Ok(ProvisionResponse::Submitted { token })
    }

    async fn status(&self, token: &str, _desired_module: &Module) -> Result<StatusResponse> {
        let Some(task) = self.tasks.get(token).map(|t| t.value().clone()) else {
            return Ok(StatusResponse::Failed {
                message: format!("unknown token: {}", token),
            });
        };

        let failed = task
            .steps
            .iter()
            .filter(|s| s.is_done())
            .find_map(|s| s.error().map(|e| format!("{} {}: {}", s.kind, s.resource_id, e)));
        if let Some(message) = failed {
            self.forget(token);
            return Ok(StatusResponse::Failed { message });
        }

        if task.steps.iter().all(|s| s.is_done()) {
            self.forget(token);
            let events = task.events.lock().map(|e| e.clone()).unwrap_or_default();
            return Ok(StatusResponse::Success { events });
        }

        Ok(StatusResponse::Running)
    }
}
