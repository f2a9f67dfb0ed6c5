//! Builds and publishes module contexts as schemas and secrets change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ModuleContext, ModuleContextError, Result};
use crate::projectconfig::{Accessor, ProjectConfig};
use crate::schema::{DatabaseEngine, Module};
use crate::schemaevents::{ChangeType, SchemaEvent, SchemaEventSource, Subscription, SubscriptionError};
use crate::secrets::{Ref, SecretUpdate, SecretsCache};
use crate::utils::retry::reconnect_backoff;

type Snapshot = Option<Arc<ModuleContext>>;

/// Holds the current context of every known module.
///
/// Each module has a watch channel; publishing replaces the snapshot in one
/// step so readers either see the old context or the new one.
pub struct ModuleContextProvider {
    project: RwLock<ProjectConfig>,
    secrets: Option<Arc<SecretsCache>>,
    testing: bool,
    test_databases: BTreeMap<String, (DatabaseEngine, String)>,
    modules: RwLock<BTreeMap<String, Module>>,
    contexts: DashMap<String, watch::Sender<Snapshot>>,
}

impl ModuleContextProvider {
    pub fn new(project: ProjectConfig) -> Self {
        Self {
            project: RwLock::new(project),
            secrets: None,
            testing: false,
            test_databases: BTreeMap::new(),
            modules: RwLock::new(BTreeMap::new()),
            contexts: DashMap::new(),
        }
    }

    pub fn with_secrets(mut self, cache: Arc<SecretsCache>) -> Self {
        self.secrets = Some(cache);
        self
    }

    /// Contexts built by this provider are testing contexts.
    pub fn testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    pub fn with_test_database(mut self, name: impl Into<String>, engine: DatabaseEngine, dsn: impl Into<String>) -> Self {
        self.test_databases.insert(name.into(), (engine, dsn.into()));
        self
    }

    /// Swap the project config and rebuild every known module.
    pub async fn set_project_config(&self, project: ProjectConfig) -> Result<()> {
        *self.project.write().await = project;
        self.rebuild_all().await
    }

    /// Assemble the context of `module` without publishing it.
    pub async fn build(&self, module: &Module) -> Result<ModuleContext> {
        let (configs, secrets) = {
            let project = self.project.read().await;
            (project.configs_for(&module.name)?, project.secrets_for(&module.name)?)
        };

        let mut builder = ModuleContext::builder(&module.name).testing(self.testing);
        for (name, accessor) in configs {
            builder = builder.with_config(name, accessor.resolve()?);
        }
        for (name, accessor) in secrets {
            let value = match &accessor {
                Accessor::Secret(reference) => self.resolve_secret(&name, reference).await?,
                other => other.resolve()?,
            };
            builder = builder.with_secret(name, value);
        }
        for database in module.databases() {
            let connections = module
                .runtime
                .databases
                .get(&database.name)
                .and_then(|db| db.connections.as_ref());
            match connections {
                Some(connections) => {
                    builder = builder.with_database(&database.name, database.engine, &connections.write);
                }
                None => debug!(module = %module.name, database = %database.name, "Database not provisioned yet"),
            }
        }
        for (name, (engine, dsn)) in &self.test_databases {
            builder = builder.with_test_database(name, *engine, dsn);
        }
        Ok(builder.build())
    }

    async fn resolve_secret(&self, name: &str, reference: &Ref) -> Result<Vec<u8>> {
        match &self.secrets {
            Some(cache) => Ok(cache.get(reference).await?),
            None => Err(ModuleContextError::SecretNotFound(name.to_string())),
        }
    }

    fn publish(&self, name: &str, context: Arc<ModuleContext>) {
        self.contexts
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(context));
    }

    /// Rebuild and publish the context of `module`.
    pub async fn update(&self, module: &Module) -> Result<Arc<ModuleContext>> {
        let context = Arc::new(self.build(module).await?);
        self.modules
            .write()
            .await
            .insert(module.name.clone(), module.clone());
        self.publish(&module.name, context.clone());
        debug!(module = %module.name, "Published module context");
        Ok(context)
    }

    /// Forget `name`. Subscribers see their stream end.
    pub async fn remove(&self, name: &str) {
        self.modules.write().await.remove(name);
        if self.contexts.remove(name).is_some() {
            info!(module = %name, "Module context retired");
        }
    }

    pub fn current(&self, name: &str) -> Option<Arc<ModuleContext>> {
        self.contexts
            .get(name)
            .and_then(|sender| sender.borrow().clone())
    }

    /// The current context of `name` (once there is one) and every replacement.
    pub fn subscribe(&self, name: &str) -> impl Stream<Item = Arc<ModuleContext>> + Send + 'static {
        let receiver = self
            .contexts
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        WatchStream::new(receiver).filter_map(|snapshot| async move { snapshot })
    }

    /// Rebuild every known module. A module that fails to build keeps its
    /// previous context; the first such error is returned after the rest
    /// have been rebuilt.
    async fn rebuild_all(&self) -> Result<()> {
        let modules: Vec<Module> = self.modules.read().await.values().cloned().collect();
        let mut first_error = None;
        for module in modules {
            if let Err(err) = self.update(&module).await {
                warn!(module = %module.name, error = %err, "Cannot rebuild module context");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn uses_secret(&self, module: &str, reference: &Ref) -> bool {
        let project = self.project.read().await;
        match project.secrets_for(module) {
            Ok(secrets) => secrets
                .values()
                .any(|accessor| matches!(accessor, Accessor::Secret(r) if r == reference)),
            Err(_) => false,
        }
    }

    /// Rebuild the contexts of modules that read `reference`.
    pub async fn refresh_secret(&self, reference: &Ref) {
        let modules: Vec<Module> = self.modules.read().await.values().cloned().collect();
        for module in modules {
            if !self.uses_secret(&module.name, reference).await {
                continue;
            }
            if let Err(err) = self.update(&module).await {
                warn!(module = %module.name, secret = %reference, error = %err, "Cannot refresh module context");
            }
        }
    }

    async fn apply(&self, event: SchemaEvent) {
        match (event.change_type, event.module) {
            (ChangeType::Added | ChangeType::Changed, Some(module)) => {
                if let Err(err) = self.update(&module).await {
                    warn!(module = %module.name, error = %err, "Cannot build module context");
                }
            }
            (ChangeType::Removed, _) => self.remove(&event.module_name).await,
            _ => {}
        }
    }

    /// Subscribe to `source` and make the known modules match its snapshot.
    async fn resync(&self, source: &SchemaEventSource) -> Subscription {
        let mut subscription = source.subscribe().await;
        let mut listed = BTreeSet::new();
        while subscription.initial_len() > 0 {
            let Ok(event) = subscription.next().await else {
                break;
            };
            if let Some(module) = &event.module {
                listed.insert(module.name.clone());
            }
            self.apply(event).await;
        }
        let stale: Vec<String> = self
            .modules
            .read()
            .await
            .keys()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove(&name).await;
        }
        debug!(modules = listed.len(), "Module contexts synced with schema");
        subscription
    }

    /// Follow schema events and secret updates until `cancel` fires or the
    /// schema source closes.
    ///
    /// A subscription that falls behind is replaced by a fresh one whose
    /// snapshot is applied in full. Repeated lags back off before resyncing.
    pub async fn run(&self, source: Arc<SchemaEventSource>, cancel: CancellationToken) {
        let mut updates = self.secrets.as_ref().map(|cache| cache.subscribe());
        let mut schema = self.resync(&source).await;
        let mut backoff: Option<ExponentialBackoff> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = schema.next() => match event {
                    Ok(event) => {
                        backoff = None;
                        self.apply(event).await;
                    }
                    Err(SubscriptionError::Lagged(n)) => {
                        warn!(dropped = n, "Module context provider lagged behind schema events, resyncing");
                        match backoff.as_mut().and_then(|b| b.next()) {
                            Some(delay) => tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            },
                            None => backoff = Some(reconnect_backoff().build()),
                        }
                        schema = self.resync(&source).await;
                    }
                    Err(err) => {
                        debug!(error = %err, "Schema subscription ended");
                        break;
                    }
                },
                update = recv_update(&mut updates) => match update {
                    Ok(update) => self.refresh_secret(&update.reference).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "Missed secret updates, rebuilding all contexts");
                        let _ = self.rebuild_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => updates = None,
                },
            }
        }
        info!("Module context provider stopped");
    }
}

async fn recv_update(
    updates: &mut Option<broadcast::Receiver<SecretUpdate>>,
) -> std::result::Result<SecretUpdate, broadcast::error::RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
