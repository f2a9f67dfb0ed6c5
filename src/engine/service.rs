//! Engine service: validates submissions, runs deployments, publishes results.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{EngineError, EngineSettings, LogicalClock, Result};
use crate::provisioner::ProvisionerRegistry;
use crate::scaling::TerminationSweeper;
use crate::schema::{
    qualify_refs, topological_sort, validate_module, validate_schema, Module, Schema,
    BUILTIN_MODULE,
};
use crate::schemaevents::SchemaEventSource;

/// Result of a successful deployment.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub module: Module,
    pub deployment_key: Option<String>,
    /// False when the deployed module equals the previously observed one.
    pub changed: bool,
}

pub struct Engine {
    cluster_id: String,
    registry: Arc<ProvisionerRegistry>,
    settings: EngineSettings,
    observed: RwLock<Arc<Schema>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Modules admitted for deployment and not yet committed or failed.
    pending: DashMap<String, Module>,
    /// Serializes admission so each candidate is checked against the others.
    admission: Mutex<()>,
    events: Arc<SchemaEventSource>,
    clock: Arc<LogicalClock>,
    cancel: CancellationToken,
    sweeper: Option<Arc<TerminationSweeper>>,
}

impl Engine {
    pub fn new(
        cluster_id: impl Into<String>,
        registry: Arc<ProvisionerRegistry>,
        events: Arc<SchemaEventSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            registry,
            settings,
            observed: RwLock::new(Arc::new(Schema::default())),
            locks: DashMap::new(),
            pending: DashMap::new(),
            admission: Mutex::new(()),
            events,
            clock: Arc::new(LogicalClock::new()),
            cancel: CancellationToken::new(),
            sweeper: None,
        }
    }

    /// Parent every deployment's cancellation scope to `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Hand deployments of removed modules to `sweeper` for termination.
    pub fn with_sweeper(mut self, sweeper: Arc<TerminationSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn events(&self) -> &Arc<SchemaEventSource> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProvisionerRegistry> {
        &self.registry
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the observed schema.
    pub async fn observed(&self) -> Arc<Schema> {
        self.observed.read().await.clone()
    }

    pub async fn module(&self, name: &str) -> Option<Module> {
        self.observed.read().await.module(name).cloned()
    }

    fn module_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Qualify and validate `module` against the observed schema and every
    /// module admitted but not yet committed.
    async fn prepare(&self, mut module: Module) -> Result<(Module, Option<Module>)> {
        qualify_refs(&mut module)?;
        validate_module(&module)?;

        let observed = self.observed().await;
        let previous = observed.module(&module.name).cloned();
        let mut candidate = (*observed).clone();
        for pending in self.pending.iter() {
            if pending.key() != &module.name {
                candidate.upsert(pending.value().clone());
            }
        }
        candidate.upsert(module.clone());
        validate_schema(&candidate)?;

        carry_over_runtime(&mut module, previous.as_ref());
        Ok((module, previous))
    }

    /// Describe what deploying `module` would change.
    pub async fn plan(&self, module: Module) -> Result<String> {
        let (desired, previous) = self.prepare(module).await?;
        Ok(self
            .registry
            .plan(&self.cluster_id, &desired, previous.as_ref())
            .await?)
    }

    /// Converge `module` and publish it as observed.
    ///
    /// A failed deployment leaves the observed schema untouched.
    #[tracing::instrument(name = "engine.deploy", skip_all, fields(module = %module.name))]
    pub async fn deploy(&self, module: Module) -> Result<DeployOutcome> {
        let lock = self.module_lock(&module.name);
        let _guard = lock.lock().await;

        let (desired, previous, _pending) = {
            let _admission = self.admission.lock().await;
            match self.prepare(module).await {
                Ok((desired, previous)) => {
                    let pending = Pending::admit(&self.pending, &desired);
                    (desired, previous, pending)
                }
                Err(err) => {
                    warn!(error = %err, "Rejected module");
                    return Err(err);
                }
            }
        };

        let mut deployment = self.registry.create_deployment(
            &self.cluster_id,
            desired,
            previous.clone(),
            &self.settings,
            self.clock.clone(),
            self.cancel.child_token(),
        )?;
        info!(tasks = deployment.tasks().len(), "Deployment created");

        if let Err(err) = deployment.run().await {
            error!(kind = ?err.kind(), error = %err, "Deployment did not converge");
            return Err(err);
        }

        let mut deployed = deployment.into_module();
        let changed = previous.as_ref() != Some(&deployed);
        if changed {
            stamp_create_time(&mut deployed, previous.as_ref());
            let mut observed = self.observed.write().await;
            let mut next = (**observed).clone();
            next.upsert(deployed.clone());
            // Other modules may have been committed since `prepare`.
            if let Err(err) = validate_schema(&next) {
                warn!(
                    error = %err,
                    deployment_key = deployed.deployment_key().unwrap_or(""),
                    "Deployment conflicts with the observed schema"
                );
                return Err(err.into());
            }
            *observed = Arc::new(next);
            self.events.upsert(deployed.clone()).await;
        }
        info!(
            deployment_key = deployed.deployment_key().unwrap_or(""),
            changed,
            "Deployment converged"
        );

        Ok(DeployOutcome {
            deployment_key: deployed.deployment_key().map(str::to_string),
            module: deployed,
            changed,
        })
    }

    /// Retire a module from the observed schema.
    #[tracing::instrument(name = "engine.remove", skip(self))]
    pub async fn remove(&self, name: &str) -> Result<Module> {
        let lock = self.module_lock(name);
        let _guard = lock.lock().await;

        let _admission = self.admission.lock().await;
        let removed = {
            let mut observed = self.observed.write().await;
            let mut next = (**observed).clone();
            let removed = next
                .remove(name)
                .ok_or_else(|| EngineError::ModuleNotFound(name.to_string()))?;
            // Nothing may import a module being retired.
            let imports_it = |m: &Module| m.name != name && m.imports().contains(name);
            let importer = next
                .modules
                .iter()
                .find(|m| imports_it(m))
                .map(|m| m.name.clone())
                .or_else(|| {
                    self.pending
                        .iter()
                        .find(|p| imports_it(p.value()))
                        .map(|p| p.key().clone())
                });
            if let Some(importer) = importer {
                return Err(EngineError::InvalidSchema(crate::schema::SchemaError::Invalid(
                    format!("module {} is imported by {}", name, importer),
                )));
            }
            *observed = Arc::new(next);
            self.events.remove(name).await;
            removed
        };

        if let (Some(sweeper), Some(key)) = (&self.sweeper, removed.deployment_key()) {
            sweeper.schedule(name, key);
        }
        info!("Module removed");
        Ok(removed)
    }

    /// Deploy every module of `schema` in dependency order.
    pub async fn bootstrap(&self, mut schema: Schema) -> Result<Vec<DeployOutcome>> {
        for module in &mut schema.modules {
            qualify_refs(module)?;
        }
        validate_schema(&schema)?;
        let mut outcomes = Vec::new();
        for level in topological_sort(&schema)? {
            for name in level {
                if name == BUILTIN_MODULE {
                    continue;
                }
                let Some(module) = schema.module(&name) else {
                    continue;
                };
                outcomes.push(self.deploy(module.clone()).await?);
            }
        }
        Ok(outcomes)
    }
}

/// Admission of one module, withdrawn when the deployment ends.
struct Pending<'a> {
    pending: &'a DashMap<String, Module>,
    name: String,
}

impl<'a> Pending<'a> {
    fn admit(pending: &'a DashMap<String, Module>, module: &Module) -> Self {
        pending.insert(module.name.clone(), module.clone());
        Self {
            pending,
            name: module.name.clone(),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.name);
    }
}

/// Give a committed revision a creation time later than the one it replaces,
/// so subscribers order revisions the way the engine committed them.
pub(super) fn stamp_create_time(deployed: &mut Module, previous: Option<&Module>) {
    let now = Utc::now();
    deployed.runtime.base.create_time = match previous {
        Some(previous) => now.max(previous.runtime.base.create_time + ChronoDuration::microseconds(1)),
        None => now,
    };
}

/// Copy runtime state the previous revision produced into `desired`.
///
/// Outputs of unchanged resources are kept, so only changed resources differ
/// after diffing.
pub(super) fn carry_over_runtime(desired: &mut Module, previous: Option<&Module>) {
    let Some(previous) = previous else {
        return;
    };
    let prior = &previous.runtime;

    if desired.content_digest() == previous.content_digest() {
        desired.runtime.base = prior.base.clone();
    }
    if desired.runtime.scaling.is_none() {
        desired.runtime.scaling = prior.scaling.clone();
    }
    if desired.runtime.deployment.is_none() {
        desired.runtime.deployment = prior.deployment.clone();
    }

    let databases: Vec<String> = desired.databases().map(|d| d.name.clone()).collect();
    for name in databases {
        if let Some(db) = prior.databases.get(&name) {
            desired.runtime.databases.entry(name).or_insert_with(|| db.clone());
        }
    }
    let topics: Vec<String> = desired.topics().map(|t| t.name.clone()).collect();
    for name in topics {
        if let Some(topic) = prior.topics.get(&name) {
            desired.runtime.topics.entry(name).or_insert_with(|| topic.clone());
        }
    }
    for (name, verb) in &prior.verbs {
        if desired.decl(name).is_some() {
            desired
                .runtime
                .verbs
                .entry(name.clone())
                .or_insert_with(|| verb.clone());
        }
    }
    for (key, clock) in &prior.clocks {
        desired.runtime.clocks.entry(key.clone()).or_insert(*clock);
    }
}
