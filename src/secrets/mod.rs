//! Secrets cache with leader/follower sync.
//!
//! Every process keeps a [`SecretsCache`]. The instance holding the sync
//! lease refreshes it from the upstream [`SecretStore`]; the others copy the
//! leader's cache over the secrets RPC. Writes go straight upstream and are
//! applied to the local cache immediately.

mod cache;
mod lease;
mod leader;
mod store;
mod sync;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cache::{SecretUpdate, SecretsCache};
pub use lease::{InMemoryLeases, Leaser};
pub use leader::{
    HttpLeaderConnector, LeaderClient, LeaderConnector, LocalLeaderClient, LocalLeaderConnector,
    SecretEntry, SecretSetRequest, SecretUnsetRequest, SecretsListRequest, SecretsListResponse,
};
pub use store::{InMemorySecretStore, SecretListing, SecretStore};
pub use sync::{Role, SecretsSync, SyncSettings};

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("invalid secret ref: {0}")]
    InvalidRef(String),

    #[error("secret {0} not found")]
    NotFound(Ref),

    #[error("secrets not loaded yet")]
    NotLoaded,

    #[error("unknown secrets provider {0}")]
    UnknownProvider(String),

    #[error("upstream secret store error: {0}")]
    Upstream(String),

    #[error("leader sync failed: {0}")]
    Leader(String),

    #[error("sync timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, SecretsError>;

/// Secret reference, `<module>.<name>` or a global `<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ref {
    pub module: Option<String>,
    pub name: String,
}

impl Ref {
    pub fn new(module: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            module: module.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn global(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }

    pub fn module(module: &str, name: impl Into<String>) -> Self {
        Self::new(Some(module), name)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}.{}", module, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for Ref {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = |part: &str| {
            !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        };
        match s.split_once('.') {
            Some((module, name)) if valid(module) && valid(name) => Ok(Ref::module(module, name)),
            None if valid(s) => Ok(Ref::global(s)),
            _ => Err(SecretsError::InvalidRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for Ref {
    type Error = SecretsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ref> for String {
    fn from(value: Ref) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests;
