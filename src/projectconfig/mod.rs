//! Project configuration file.
//!
//! A TOML document holding config values and secret references for all
//! modules and per module:
//!
//! ```toml
//! [global.config]
//! region = "inline://ImV1LXdlc3Qi"
//!
//! [modules.svc.config]
//! endpoint = "env://SVC_ENDPOINT"
//!
//! [modules.svc.secrets]
//! password = "secrets://svc.password"
//! ```
//!
//! Values are accessor URLs: `inline://<base64>`, `env://<VAR>` or
//! `secrets://<ref>`. Module entries override global ones of the same name.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::secrets::Ref;

#[derive(Debug, thiserror::Error)]
pub enum ProjectConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid project config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot write project config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid accessor {0}")]
    InvalidAccessor(String),

    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("{0} is a secret reference, not a config value")]
    NotAConfig(String),
}

pub type Result<T> = std::result::Result<T, ProjectConfigError>;

/// Where a value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    Inline(Vec<u8>),
    Env(String),
    Secret(Ref),
}

impl Accessor {
    pub fn inline(value: &[u8]) -> Self {
        Accessor::Inline(value.to_vec())
    }

    /// Value of an inline or environment accessor.
    pub fn resolve(&self) -> Result<Vec<u8>> {
        match self {
            Accessor::Inline(value) => Ok(value.clone()),
            Accessor::Env(var) => std::env::var(var)
                .map(String::into_bytes)
                .map_err(|_| ProjectConfigError::EnvNotSet(var.clone())),
            Accessor::Secret(_) => Err(ProjectConfigError::NotAConfig(self.to_string())),
        }
    }
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accessor::Inline(value) => write!(f, "inline://{}", STANDARD.encode(value)),
            Accessor::Env(var) => write!(f, "env://{}", var),
            Accessor::Secret(reference) => write!(f, "secrets://{}", reference),
        }
    }
}

impl FromStr for Accessor {
    type Err = ProjectConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProjectConfigError::InvalidAccessor(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        match scheme {
            "inline" => STANDARD
                .decode(rest)
                .map(Accessor::Inline)
                .map_err(|_| invalid()),
            "env" if !rest.is_empty() => Ok(Accessor::Env(rest.to_string())),
            "secrets" => rest.parse().map(Accessor::Secret).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

/// Config values and secrets of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Config,
    Secrets,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub global: Scope,
    pub modules: BTreeMap<String, Scope>,
}

impl ProjectConfig {
    /// Parse and check every accessor.
    pub fn parse(text: &str) -> Result<Self> {
        let config: ProjectConfig = toml::from_str(text)?;
        for scope in std::iter::once(&config.global).chain(config.modules.values()) {
            for value in scope.config.values().chain(scope.secrets.values()) {
                value.parse::<Accessor>()?;
            }
        }
        Ok(config)
    }

    /// Load from `path`; a missing file is an empty config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn scope_mut(&mut self, module: Option<&str>) -> &mut Scope {
        match module {
            Some(module) => self.modules.entry(module.to_string()).or_default(),
            None => &mut self.global,
        }
    }

    pub fn set_config(&mut self, module: Option<&str>, name: &str, accessor: &Accessor) {
        self.scope_mut(module)
            .config
            .insert(name.to_string(), accessor.to_string());
    }

    pub fn unset_config(&mut self, module: Option<&str>, name: &str) -> bool {
        self.scope_mut(module).config.remove(name).is_some()
    }

    pub fn set_secret(&mut self, module: Option<&str>, name: &str, reference: &Ref) {
        self.scope_mut(module)
            .secrets
            .insert(name.to_string(), Accessor::Secret(reference.clone()).to_string());
    }

    pub fn unset_secret(&mut self, module: Option<&str>, name: &str) -> bool {
        self.scope_mut(module).secrets.remove(name).is_some()
    }

    fn merged(&self, module: &str, section: Section) -> Result<BTreeMap<String, Accessor>> {
        let pick = |scope: &Scope| match section {
            Section::Config => scope.config.clone(),
            Section::Secrets => scope.secrets.clone(),
        };
        let mut entries = pick(&self.global);
        if let Some(scope) = self.modules.get(module) {
            entries.extend(pick(scope));
        }
        entries
            .into_iter()
            .map(|(name, value)| Ok((name, value.parse()?)))
            .collect()
    }

    /// Config accessors visible to `module`.
    pub fn configs_for(&self, module: &str) -> Result<BTreeMap<String, Accessor>> {
        self.merged(module, Section::Config)
    }

    /// Secret accessors visible to `module`.
    pub fn secrets_for(&self, module: &str) -> Result<BTreeMap<String, Accessor>> {
        self.merged(module, Section::Secrets)
    }
}

#[cfg(test)]
mod tests;
