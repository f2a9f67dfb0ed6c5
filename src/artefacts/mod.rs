//! Content-addressed artefact storage.
//!
//! Artefacts (deployment bundles, migration archives) are addressed by the
//! hex SHA-256 digest of their content. Reads verify the digest.
//!
//! - `FilesystemArtefactStore` - Local filesystem storage
//! - `InMemoryArtefactStore` - Process-local storage for tests and dev mode

mod filesystem;

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

pub use filesystem::FilesystemArtefactStore;

#[derive(Debug, Error)]
pub enum ArtefactError {
    #[error("Artefact not found: {0}")]
    NotFound(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailed { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArtefactError>;

/// Hex SHA-256 digest of `content`.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn check_digest(digest: &str) -> Result<()> {
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ArtefactError::InvalidDigest(digest.to_string()))
    }
}

/// Storage for artefacts keyed by content digest.
#[async_trait]
pub trait ArtefactStore: Send + Sync {
    /// Store `content`, returning its digest. Storing the same content twice is a no-op.
    async fn put(&self, content: &[u8]) -> Result<String>;

    /// Fetch the artefact with `digest`, verifying its integrity.
    async fn get(&self, digest: &str) -> Result<Vec<u8>>;

    async fn contains(&self, digest: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryArtefactStore {
    artefacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtefactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtefactStore for InMemoryArtefactStore {
    async fn put(&self, content: &[u8]) -> Result<String> {
        let digest = digest(content);
        self.artefacts
            .write()
            .await
            .entry(digest.clone())
            .or_insert_with(|| content.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &str) -> Result<Vec<u8>> {
        check_digest(digest)?;
        self.artefacts
            .read()
            .await
            .get(digest)
            .cloned()
            .ok_or_else(|| ArtefactError::NotFound(digest.to_string()))
    }

    async fn contains(&self, digest: &str) -> Result<bool> {
        Ok(self.artefacts.read().await.contains_key(digest))
    }
}
