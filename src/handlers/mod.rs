//! Resource handlers of the builtin in-process provisioners.
//!
//! - `dev` - local Postgres/MySQL databases and broker topics
//! - `migration` - SQL migration archives
//! - `controller` - deployment keys for module resources
//! - `scaling` - runners through a scaling backend
//! - `cloud` - declarative cloud stacks, when a stack client is configured

pub mod archive;
pub mod database;
pub mod migration;
pub mod module;
pub mod runner;
pub mod topic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::artefacts::ArtefactStore;
use crate::cloud::{CloudStackProvisioner, StackClient};
use crate::config::DevConfig;
use crate::provisioner::{InMemProvisioner, NoopProvisioner, Provisioner};
use crate::scaling::{RouteTable, RunnerScaling, TerminationSweeper};
use crate::schema::{DatabaseEngine, ResourceKind};

pub use database::DatabaseHandler;
pub use migration::MigrationHandler;
pub use module::ModuleHandler;
pub use runner::RunnerHandler;
pub use topic::TopicHandler;

/// Collaborators the builtin provisioners run against.
pub struct Backends {
    pub dev: DevConfig,
    pub artefacts: Arc<dyn ArtefactStore>,
    pub scaling: Arc<dyn RunnerScaling>,
    pub routes: Arc<RouteTable>,
    pub sweeper: Arc<TerminationSweeper>,
    pub stacks: Option<Arc<dyn StackClient>>,
    /// How long a runner may take to report an endpoint.
    pub endpoint_timeout: Duration,
}

/// Builtin provisioners by id, every task scoped under `cancel`.
pub fn builtin_provisioners(
    backends: &Backends,
    cancel: &CancellationToken,
) -> HashMap<String, Arc<dyn Provisioner>> {
    let readiness = Duration::from_secs(backends.dev.readiness_timeout_secs);

    let dev = InMemProvisioner::new("dev")
        .with_handler(
            ResourceKind::Postgres,
            Arc::new(DatabaseHandler::new(
                DatabaseEngine::Postgres,
                backends.dev.postgres_dsn.clone(),
                readiness,
            )),
        )
        .with_handler(
            ResourceKind::Mysql,
            Arc::new(DatabaseHandler::new(
                DatabaseEngine::Mysql,
                backends.dev.mysql_dsn.clone(),
                readiness,
            )),
        )
        .with_handler(
            ResourceKind::Topic,
            Arc::new(TopicHandler::new(backends.dev.brokers.clone())),
        )
        .with_cancellation(cancel.child_token());

    let migration = InMemProvisioner::new("migration")
        .with_handler(
            ResourceKind::SqlMigration,
            Arc::new(MigrationHandler::new(backends.artefacts.clone())),
        )
        .with_cancellation(cancel.child_token());

    let controller = InMemProvisioner::new("controller")
        .with_handler(
            ResourceKind::Module,
            Arc::new(ModuleHandler::new().with_artefacts(backends.artefacts.clone())),
        )
        .with_cancellation(cancel.child_token());

    let scaling = InMemProvisioner::new("scaling")
        .with_handler(
            ResourceKind::Runner,
            Arc::new(
                RunnerHandler::new(
                    backends.scaling.clone(),
                    backends.routes.clone(),
                    backends.endpoint_timeout,
                )
                .with_sweeper(backends.sweeper.clone()),
            ),
        )
        .with_cancellation(cancel.child_token());

    let mut provisioners: HashMap<String, Arc<dyn Provisioner>> = HashMap::new();
    provisioners.insert("noop".to_string(), Arc::new(NoopProvisioner));
    provisioners.insert("dev".to_string(), Arc::new(dev));
    provisioners.insert("migration".to_string(), Arc::new(migration));
    provisioners.insert("controller".to_string(), Arc::new(controller));
    provisioners.insert("scaling".to_string(), Arc::new(scaling));
    if let Some(stacks) = &backends.stacks {
        provisioners.insert(
            "cloud".to_string(),
            Arc::new(CloudStackProvisioner::new(
                "cloud",
                stacks.clone(),
                vec![ResourceKind::Postgres, ResourceKind::Mysql, ResourceKind::Topic],
            )),
        );
    }
    provisioners
}
