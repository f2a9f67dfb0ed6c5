//! Schema model.
//!
//! A [`Schema`] is the set of deployed modules. Each [`Module`] declares
//! verbs, data types, databases, topics, secrets and config values, and
//! carries the runtime state the provisioners filled in.

mod builtin;
mod decl;
mod index;
mod provisioned;
mod runtime;
mod topology;
mod validate;
mod visit;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use builtin::{builtin_module, BUILTIN_MODULE};
pub use decl::{
    Config, Data, Database, DatabaseEngine, Decl, Enum, EnumValue, EnumVariant, Field, Metadata,
    Position, Ref, RefKey, Secret, Topic, Type, TypeAlias, Verb,
};
pub use index::SchemaIndex;
pub use provisioned::{
    get_provisioned, migration_resource_id, module_migration_resource_id, module_resource_id,
    runner_resource_id, ArtefactSpec, Provisioned, ResourceKind, ResourceOutput, ResourceRef,
    ResourceSpec,
};
pub use runtime::{
    DatabaseConnections, DatabaseRuntime, DatabaseRuntimeEvent, ModuleRuntime, ModuleRuntimeBase,
    ModuleRuntimeDeployment, ModuleRuntimeEvent, ModuleRuntimeScaling, RuntimeEvent,
    SubscriptionRuntime, TopicRuntime, TopicRuntimeEvent, VerbRuntime, VerbRuntimeEvent,
};
pub use topology::topological_sort;
pub use validate::{qualify_refs, validate_module, validate_schema};
pub use visit::{
    visit, visit_mut, visit_through_refs, walk, Inspect, Next, NextMut, Node, NodeMut, Visitor,
    VisitorMut,
};

/// Errors from schema traversal and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("cyclic reference while visiting {0}")]
    CyclicReference(String),

    #[error("visitor failed: {0}")]
    Visitor(String),

    #[error("cycle detected between modules: {}", participants.join(", "))]
    CycleDetected { participants: Vec<String> },

    #[error("duplicate declaration {module}.{name}")]
    DuplicateDecl { module: String, name: String },

    #[error("unresolved reference {reference} in module {module}")]
    UnresolvedRef { module: String, reference: String },

    #[error("invalid identifier {0:?}")]
    InvalidName(String),

    #[error("invalid schema: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// A deployable unit of declarations plus its runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub decls: Vec<Decl>,
    #[serde(default)]
    pub runtime: ModuleRuntime,
    #[serde(default)]
    pub pos: Position,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_decl(mut self, decl: Decl) -> Self {
        self.decls.push(decl);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    pub fn decl(&self, name: &str) -> Option<&Decl> {
        self.decls.iter().find(|d| d.name() == name)
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Database(db) => Some(db),
            _ => None,
        })
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Topic(t) => Some(t),
            _ => None,
        })
    }

    /// Other modules referenced by this module's declarations.
    ///
    /// The builtin module and self-references are excluded.
    pub fn imports(&self) -> BTreeSet<String> {
        let mut imports = BTreeSet::new();
        walk(Node::Module(self), &mut |node| {
            if let Node::Ref(r) = node {
                if !r.module.is_empty() && r.module != self.name && r.module != BUILTIN_MODULE {
                    imports.insert(r.module.clone());
                }
            }
        });
        imports
    }

    /// Deployment key assigned by the module provisioner, if any.
    pub fn deployment_key(&self) -> Option<&str> {
        self.runtime.deployment_key()
    }

    /// Apply a runtime event stamped with `clock`.
    ///
    /// Returns false when an update with the same or a newer clock was already applied.
    pub fn apply_event(&mut self, event: &RuntimeEvent, clock: u64) -> bool {
        event.apply(&mut self.runtime, clock)
    }

    /// Digest of the module's declarations and metadata, excluding runtime state.
    pub fn content_digest(&self) -> String {
        #[derive(Serialize)]
        struct Content<'a> {
            name: &'a str,
            metadata: &'a [Metadata],
            decls: &'a [Decl],
        }
        digest_of(&Content {
            name: &self.name,
            metadata: &self.metadata,
            decls: &self.decls,
        })
    }
}

/// sha256 hex digest of the canonical JSON form of `value`.
pub(crate) fn digest_of<T: Serialize>(value: &T) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// The set of deployed modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub modules: Vec<Module>,
}

impl Schema {
    pub fn new(modules: Vec<Module>) -> Self {
        Self { modules }
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Insert or replace the module with the same name.
    pub fn upsert(&mut self, module: Module) {
        match self.modules.iter_mut().find(|m| m.name == module.name) {
            Some(existing) => *existing = module,
            None => self.modules.push(module),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Module> {
        let idx = self.modules.iter().position(|m| m.name == name)?;
        Some(self.modules.remove(idx))
    }

    /// Copy of this schema including the builtin module if absent.
    pub fn with_builtins(&self) -> Schema {
        let mut schema = self.clone();
        if schema.module(BUILTIN_MODULE).is_none() {
            schema.modules.insert(0, builtin_module());
        }
        schema
    }
}
