//! Provisionable resources derived from a module.
//!
//! [`get_provisioned`] maps a module's declarations to the infrastructure it
//! needs. Two resources are equal when their id, kind and content hash
//! match; outputs never take part in equality.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::decl::{DatabaseEngine, Metadata, Type};
use super::runtime::{DatabaseConnections, TopicRuntime};
use super::{digest_of, Module};

/// Kind of a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Postgres,
    Mysql,
    Topic,
    #[serde(alias = "sqlmigration")]
    SqlMigration,
    Runner,
    Module,
    Unknown,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Postgres,
        ResourceKind::Mysql,
        ResourceKind::Topic,
        ResourceKind::SqlMigration,
        ResourceKind::Runner,
        ResourceKind::Module,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Postgres => "postgres",
            ResourceKind::Mysql => "mysql",
            ResourceKind::Topic => "topic",
            ResourceKind::SqlMigration => "sql-migration",
            ResourceKind::Runner => "runner",
            ResourceKind::Module => "module",
            ResourceKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(ResourceKind::Postgres),
            "mysql" => Ok(ResourceKind::Mysql),
            "topic" => Ok(ResourceKind::Topic),
            "sql-migration" | "sqlmigration" => Ok(ResourceKind::SqlMigration),
            "runner" => Ok(ResourceKind::Runner),
            "module" => Ok(ResourceKind::Module),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

impl From<DatabaseEngine> for ResourceKind {
    fn from(engine: DatabaseEngine) -> Self {
        match engine {
            DatabaseEngine::Postgres => ResourceKind::Postgres,
            DatabaseEngine::Mysql => ResourceKind::Mysql,
        }
    }
}

/// Reference to another resource of the same module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

/// What a handler needs to create the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSpec {
    Database {
        engine: DatabaseEngine,
    },
    Topic {
        event: Type,
    },
    SqlMigration {
        digest: String,
    },
    Module {
        digest: String,
        artefacts: Vec<ArtefactSpec>,
    },
    Runner {
        digest: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactSpec {
    pub path: String,
    pub digest: String,
    pub executable: bool,
}

/// What provisioning produced, read back from the module's runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOutput {
    Database(DatabaseConnections),
    Topic(TopicRuntime),
    SqlMigration {
        digest: String,
    },
    Module {
        deployment_key: String,
    },
    Runner {
        deployment_key: String,
        endpoint: String,
    },
}

/// A resource a module needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provisioned {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub dependencies: Vec<ResourceRef>,
    pub spec: ResourceSpec,
    pub content_hash: String,
    #[serde(default)]
    pub output: Option<ResourceOutput>,
}

impl PartialEq for Provisioned {
    fn eq(&self, other: &Self) -> bool {
        self.resource_id == other.resource_id
            && self.kind == other.kind
            && self.content_hash == other.content_hash
    }
}

impl Eq for Provisioned {}

impl Provisioned {
    pub fn new(
        resource_id: impl Into<String>,
        kind: ResourceKind,
        spec: ResourceSpec,
        mut dependencies: Vec<ResourceRef>,
    ) -> Self {
        let resource_id = resource_id.into();
        dependencies.sort();
        dependencies.dedup();
        let content_hash = digest_of(&(kind, &resource_id, &spec, &dependencies));
        Self {
            resource_id,
            kind,
            dependencies,
            spec,
            content_hash,
            output: None,
        }
    }

    pub fn with_output(mut self, output: Option<ResourceOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind,
            id: self.resource_id.clone(),
        }
    }
}

pub fn module_resource_id(module: &str) -> String {
    format!("{}.module", module)
}

pub fn runner_resource_id(module: &str) -> String {
    format!("{}.runner", module)
}

pub fn migration_resource_id(database: &str) -> String {
    format!("{}.migration", database)
}

/// Identifiers cannot contain `-`, so this never meets a database migration id.
pub fn module_migration_resource_id(module: &str) -> String {
    format!("{}.module-migration", module)
}

/// Resources `module` needs, keyed by resource id.
///
/// Builtin modules need nothing.
pub fn get_provisioned(module: &Module) -> BTreeMap<String, Provisioned> {
    let mut out = BTreeMap::new();
    if module.builtin {
        return out;
    }
    let runtime = &module.runtime;
    let mut module_deps = Vec::new();

    for db in module.databases() {
        let kind = ResourceKind::from(db.engine);
        let db_runtime = runtime.databases.get(&db.name);
        let resource = Provisioned::new(
            db.name.clone(),
            kind,
            ResourceSpec::Database { engine: db.engine },
            Vec::new(),
        )
        .with_output(
            db_runtime
                .and_then(|r| r.connections.clone())
                .map(ResourceOutput::Database),
        );
        module_deps.push(resource.reference());
        let db_ref = resource.reference();
        out.insert(resource.resource_id.clone(), resource);

        for meta in &db.metadata {
            if let Metadata::SqlMigration { digest } = meta {
                let applied = db_runtime
                    .and_then(|r| r.migration_digest.as_ref())
                    .filter(|applied| *applied == digest)
                    .map(|digest| ResourceOutput::SqlMigration {
                        digest: digest.clone(),
                    });
                let migration = Provisioned::new(
                    migration_resource_id(&db.name),
                    ResourceKind::SqlMigration,
                    ResourceSpec::SqlMigration {
                        digest: digest.clone(),
                    },
                    vec![db_ref.clone()],
                )
                .with_output(applied);
                module_deps.push(migration.reference());
                out.insert(migration.resource_id.clone(), migration);
            }
        }
    }

    for topic in module.topics() {
        let resource = Provisioned::new(
            topic.name.clone(),
            ResourceKind::Topic,
            ResourceSpec::Topic {
                event: topic.event.clone(),
            },
            Vec::new(),
        )
        .with_output(
            runtime
                .topics
                .get(&topic.name)
                .cloned()
                .map(ResourceOutput::Topic),
        );
        module_deps.push(resource.reference());
        out.insert(resource.resource_id.clone(), resource);
    }

    // A migration attached to the module itself has no database to run against.
    for meta in &module.metadata {
        if let Metadata::SqlMigration { digest } = meta {
            let migration = Provisioned::new(
                module_migration_resource_id(&module.name),
                ResourceKind::SqlMigration,
                ResourceSpec::SqlMigration {
                    digest: digest.clone(),
                },
                Vec::new(),
            );
            module_deps.push(migration.reference());
            out.insert(migration.resource_id.clone(), migration);
        }
    }

    let digest = module.content_digest();
    let artefacts = module
        .metadata
        .iter()
        .filter_map(|m| match m {
            Metadata::Artefact {
                path,
                digest,
                executable,
            } => Some(ArtefactSpec {
                path: path.clone(),
                digest: digest.clone(),
                executable: *executable,
            }),
            _ => None,
        })
        .collect();
    let module_resource = Provisioned::new(
        module_resource_id(&module.name),
        ResourceKind::Module,
        ResourceSpec::Module {
            digest: digest.clone(),
            artefacts,
        },
        module_deps,
    )
    .with_output(runtime.deployment.as_ref().map(|d| ResourceOutput::Module {
        deployment_key: d.deployment_key.clone(),
    }));
    let module_ref = module_resource.reference();
    out.insert(module_resource.resource_id.clone(), module_resource);

    let runner = Provisioned::new(
        runner_resource_id(&module.name),
        ResourceKind::Runner,
        ResourceSpec::Runner { digest },
        vec![module_ref],
    )
    .with_output(runtime.deployment.as_ref().and_then(|d| {
        d.endpoint.as_ref().map(|endpoint| ResourceOutput::Runner {
            deployment_key: d.deployment_key.clone(),
            endpoint: endpoint.clone(),
        })
    }));
    out.insert(runner.resource_id.clone(), runner);

    out
}
