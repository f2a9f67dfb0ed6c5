//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use provisioner::artefacts::{ArtefactStore, InMemoryArtefactStore};
use provisioner::config::DevConfig;
use provisioner::engine::{Engine, EngineSettings};
use provisioner::handlers::{builtin_provisioners, Backends};
use provisioner::provisioner::{InMemProvisioner, PluginConfig, Provisioner, ProvisionerRegistry};
use provisioner::scaling::{InMemoryScaling, RouteTable, RunnerScaling, TerminationSweeper};
use provisioner::schema::{DatabaseConnections, DatabaseRuntimeEvent, ResourceKind, RuntimeEvent};
use provisioner::schemaevents::SchemaEventSource;
use provisioner::test_utils::ScriptedHandler;

pub const SALES_DSN: &str = "postgres://127.0.0.1:5432/svc_sales";

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        max_task_retries: 3,
        call_timeout: Duration::from_secs(5),
        poll_min: Duration::from_millis(1),
        poll_max: Duration::from_millis(20),
    }
}

pub fn sales_event() -> RuntimeEvent {
    RuntimeEvent::Database(DatabaseRuntimeEvent {
        id: "sales".to_string(),
        connections: Some(DatabaseConnections {
            read: SALES_DSN.to_string(),
            write: SALES_DSN.to_string(),
        }),
        migration_digest: None,
    })
}

/// Engine wired to the builtin provisioners, with the dev databases scripted.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub scaling: Arc<InMemoryScaling>,
    pub routes: Arc<RouteTable>,
    pub sweeper: Arc<TerminationSweeper>,
    pub artefacts: Arc<InMemoryArtefactStore>,
    pub postgres: Arc<ScriptedHandler>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(endpoints: &[&str]) -> Self {
        let cancel = CancellationToken::new();
        let scaling = Arc::new(
            InMemoryScaling::default()
                .with_endpoints(endpoints.iter().map(|e| e.to_string()).collect()),
        );
        let routes = Arc::new(RouteTable::new());
        let sweeper = Arc::new(TerminationSweeper::new(
            scaling.clone() as Arc<dyn RunnerScaling>,
            Duration::from_millis(50),
        ));
        let artefacts = Arc::new(InMemoryArtefactStore::new());
        let backends = Backends {
            dev: DevConfig::default(),
            artefacts: artefacts.clone() as Arc<dyn ArtefactStore>,
            scaling: scaling.clone(),
            routes: routes.clone(),
            sweeper: sweeper.clone(),
            stacks: None,
            endpoint_timeout: Duration::from_secs(5),
        };

        let postgres = Arc::new(ScriptedHandler::emitting(Some(sales_event())));
        let mut provisioners: HashMap<String, Arc<dyn Provisioner>> =
            builtin_provisioners(&backends, &cancel);
        provisioners.insert(
            "dev".to_string(),
            Arc::new(
                InMemProvisioner::new("dev")
                    .with_handler(ResourceKind::Postgres, postgres.clone())
                    .with_cancellation(cancel.child_token()),
            ),
        );
        let registry = ProvisionerRegistry::from_config(&PluginConfig::local(), &provisioners)
            .expect("local plugin config is valid");

        let engine = Arc::new(
            Engine::new(
                "test",
                Arc::new(registry),
                Arc::new(SchemaEventSource::new()),
                fast_settings(),
            )
            .with_cancellation(cancel.child_token())
            .with_sweeper(sweeper.clone()),
        );

        Self {
            engine,
            scaling,
            routes,
            sweeper,
            artefacts,
            postgres,
            cancel,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
