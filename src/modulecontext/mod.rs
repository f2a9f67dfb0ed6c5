//! Per-module view of configs, secrets and databases.
//!
//! A [`ModuleContext`] is an immutable snapshot. The provider publishes a new
//! snapshot whenever the module's schema or one of its secrets changes;
//! holders of an old snapshot keep seeing it unchanged.

mod provider;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::projectconfig::ProjectConfigError;
use crate::schema::DatabaseEngine;
use crate::secrets::SecretsError;

pub use provider::ModuleContextProvider;

#[derive(Debug, thiserror::Error)]
pub enum ModuleContextError {
    #[error("config {0} not found")]
    ConfigNotFound(String),

    #[error("secret {0} not found")]
    SecretNotFound(String),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("database {name} is {actual}, not {requested}")]
    DatabaseKindMismatch {
        name: String,
        requested: DatabaseEngine,
        actual: DatabaseEngine,
    },

    #[error("database {0} is not a test database")]
    NotTestDatabase(String),

    #[error("cannot decode {name}: {cause}")]
    Decode { name: String, cause: String },

    #[error(transparent)]
    ProjectConfig(#[from] ProjectConfigError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

pub type Result<T> = std::result::Result<T, ModuleContextError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEntry {
    pub engine: DatabaseEngine,
    pub dsn: String,
    pub is_test: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleContext {
    module: String,
    configs: BTreeMap<String, Vec<u8>>,
    secrets: BTreeMap<String, Vec<u8>>,
    databases: BTreeMap<String, DatabaseEntry>,
    testing: bool,
}

impl ModuleContext {
    pub fn builder(module: impl Into<String>) -> ModuleContextBuilder {
        ModuleContextBuilder {
            context: ModuleContext {
                module: module.into(),
                ..Default::default()
            },
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_testing(&self) -> bool {
        self.testing
    }

    pub fn configs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.configs
    }

    pub fn secrets(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.secrets
    }

    pub fn databases(&self) -> &BTreeMap<String, DatabaseEntry> {
        &self.databases
    }

    pub fn get_config(&self, name: &str) -> Result<&[u8]> {
        self.configs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ModuleContextError::ConfigNotFound(name.to_string()))
    }

    /// Config value decoded from JSON.
    pub fn config_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_slice(self.get_config(name)?).map_err(|e| ModuleContextError::Decode {
            name: name.to_string(),
            cause: e.to_string(),
        })
    }

    pub fn get_secret(&self, name: &str) -> Result<&[u8]> {
        self.secrets
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ModuleContextError::SecretNotFound(name.to_string()))
    }

    /// DSN of database `name`, which must be of `engine`.
    ///
    /// A testing context only hands out databases registered as test databases.
    pub fn get_database(&self, name: &str, engine: DatabaseEngine) -> Result<&str> {
        let entry = self
            .databases
            .get(name)
            .ok_or_else(|| ModuleContextError::DatabaseNotFound(name.to_string()))?;
        if entry.engine != engine {
            return Err(ModuleContextError::DatabaseKindMismatch {
                name: name.to_string(),
                requested: engine,
                actual: entry.engine,
            });
        }
        if self.testing && !entry.is_test {
            return Err(ModuleContextError::NotTestDatabase(name.to_string()));
        }
        Ok(&entry.dsn)
    }
}

pub struct ModuleContextBuilder {
    context: ModuleContext,
}

impl ModuleContextBuilder {
    pub fn with_config(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.context.configs.insert(name.into(), value.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.context.secrets.insert(name.into(), value.into());
        self
    }

    pub fn with_database(mut self, name: impl Into<String>, engine: DatabaseEngine, dsn: impl Into<String>) -> Self {
        self.context.databases.insert(
            name.into(),
            DatabaseEntry {
                engine,
                dsn: dsn.into(),
                is_test: false,
            },
        );
        self
    }

    /// Register a database usable from a testing context. Replaces any entry of the same name.
    pub fn with_test_database(mut self, name: impl Into<String>, engine: DatabaseEngine, dsn: impl Into<String>) -> Self {
        self.context.databases.insert(
            name.into(),
            DatabaseEntry {
                engine,
                dsn: dsn.into(),
                is_test: true,
            },
        );
        self
    }

    pub fn testing(mut self, testing: bool) -> Self {
        self.context.testing = testing;
        self
    }

    pub fn build(self) -> ModuleContext {
        self.context
    }
}

#[cfg(test)]
mod tests;
