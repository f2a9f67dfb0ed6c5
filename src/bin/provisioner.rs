//! provisioner: deployment control plane
//!
//! Runs the deployment engine with the builtin provisioners, serves the
//! admin, schema pull and secrets RPC, keeps the secrets cache in sync and
//! maintains module contexts.
//!
//! ## Configuration
//! - `provisioner.yaml` in the working directory, or the file named by
//!   `PROVISIONER_CONFIG`
//! - `PROVISIONER__<SECTION>__<KEY>` environment overrides
//! - `PROVISIONER_LOG`: log filter (default: info)
//!
//! ## Exit codes
//! - 0: clean shutdown
//! - 1: invalid configuration or provisioner registry
//! - 2: the bootstrap schema failed to deploy

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use provisioner::artefacts::{ArtefactStore, FilesystemArtefactStore};
use provisioner::config::Config;
use provisioner::engine::{Engine, EngineSettings};
use provisioner::handlers::{builtin_provisioners, Backends};
use provisioner::modulecontext::ModuleContextProvider;
use provisioner::projectconfig::ProjectConfig;
use provisioner::provisioner::{PluginConfig, ProvisionerRegistry};
use provisioner::rpc::{self, RpcState};
use provisioner::scaling::{InMemoryScaling, RouteTable, RunnerScaling, TerminationSweeper};
use provisioner::schema::Schema;
use provisioner::schemaevents::SchemaEventSource;
use provisioner::secrets::{
    HttpLeaderConnector, InMemoryLeases, InMemorySecretStore, SecretsCache, SecretsSync,
    SyncSettings,
};
use provisioner::utils::bootstrap::init_tracing;

/// How often superseded runners are retried for termination.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How long a started runner may take to report its endpoint.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("{0}")]
    Config(String),

    #[error("bootstrap deployment failed: {0}")]
    Bootstrap(String),
}

impl StartupError {
    fn config(err: impl std::fmt::Display) -> Self {
        StartupError::Config(err.to_string())
    }

    fn exit_code(&self) -> ExitCode {
        match self {
            StartupError::Config(_) => ExitCode::from(1),
            StartupError::Bootstrap(_) => ExitCode::from(2),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "provisioner stopped");
            err.exit_code()
        }
    }
}

fn load_bootstrap_schema(path: &str) -> Result<Schema, StartupError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StartupError::Config(format!("cannot read bootstrap schema {}: {}", path, e)))?;
    serde_json::from_str(&text)
        .map_err(|e| StartupError::Config(format!("invalid bootstrap schema {}: {}", path, e)))
}

async fn run() -> Result<(), StartupError> {
    let config = Config::load(None).map_err(StartupError::config)?;
    info!(cluster_id = %config.cluster_id, "starting provisioner");

    let cancel = CancellationToken::new();

    let artefacts: Arc<dyn ArtefactStore> = Arc::new(
        FilesystemArtefactStore::new(&config.artefacts.path)
            .await
            .map_err(StartupError::config)?,
    );
    let scaling: Arc<dyn RunnerScaling> = Arc::new(InMemoryScaling::default());
    let sweeper = Arc::new(TerminationSweeper::new(scaling.clone(), SWEEP_INTERVAL));
    let backends = Backends {
        dev: config.dev.clone(),
        artefacts,
        scaling,
        routes: Arc::new(RouteTable::new()),
        sweeper: sweeper.clone(),
        stacks: None,
        endpoint_timeout: ENDPOINT_TIMEOUT,
    };
    let builtins = builtin_provisioners(&backends, &cancel);

    let plugins = match &config.registry.plugins {
        Some(path) => PluginConfig::load(path).map_err(StartupError::config)?,
        None => PluginConfig::local(),
    };
    let registry = ProvisionerRegistry::from_config(&plugins, &builtins).map_err(StartupError::config)?;

    let events = Arc::new(SchemaEventSource::new());
    let engine = Arc::new(
        Engine::new(
            config.cluster_id.clone(),
            Arc::new(registry),
            events.clone(),
            EngineSettings::from(&config.engine),
        )
        .with_cancellation(cancel.child_token())
        .with_sweeper(sweeper.clone()),
    );

    let cache = Arc::new(SecretsCache::new(
        "inmem",
        Arc::new(InMemorySecretStore::new()),
        Duration::from_secs(config.secrets.load_timeout_secs),
    ));
    let sync = Arc::new(SecretsSync::new(
        cache.clone(),
        Arc::new(InMemoryLeases::new()),
        Arc::new(HttpLeaderConnector::new(cache.provider())),
        config.server.advertised(),
        SyncSettings::from(&config.secrets),
    ));

    let project = match &config.project_config {
        Some(path) => ProjectConfig::load(path).map_err(StartupError::config)?,
        None => ProjectConfig::default(),
    };
    let contexts = Arc::new(ModuleContextProvider::new(project).with_secrets(cache.clone()));

    let bootstrap = config
        .bootstrap_schema
        .as_deref()
        .map(load_bootstrap_schema)
        .transpose()?;

    let router = rpc::router(
        RpcState::new()
            .with_engine(engine.clone())
            .with_secrets_sync(sync.clone()),
    );
    let listener = tokio::net::TcpListener::bind(config.server.bind_address())
        .await
        .map_err(StartupError::config)?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = rpc::serve_listener(router, listener, cancel).await {
                error!(error = %e, "RPC server failed");
            }
        }
    }));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { sync.run(cancel).await }
    }));
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        let events = events.clone();
        async move { contexts.run(events, cancel).await }
    }));

    if let Some(schema) = bootstrap {
        info!(modules = schema.modules.len(), "deploying bootstrap schema");
        if let Err(e) = engine.bootstrap(schema).await {
            cancel.cancel();
            for task in tasks {
                let _ = task.await;
            }
            return Err(StartupError::Bootstrap(e.to_string()));
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutting down");
    cancel.cancel();
    engine.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
