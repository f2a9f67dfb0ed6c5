//! Filesystem-based artefact storage.
//!
//! Stores artefacts as files in a directory structure:
//! ```text
//! {base_path}/
//!   {digest[0:2]}/
//!     {digest}.bin
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{check_digest, digest, ArtefactError, ArtefactStore, Result};

pub struct FilesystemArtefactStore {
    base_path: PathBuf,
}

impl FilesystemArtefactStore {
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn path_for_digest(&self, digest: &str) -> PathBuf {
        self.base_path
            .join(&digest[0..2])
            .join(format!("{}.bin", digest))
    }
}

#[async_trait]
impl ArtefactStore for FilesystemArtefactStore {
    async fn put(&self, content: &[u8]) -> Result<String> {
        let digest = digest(content);
        let path = self.path_for_digest(&digest);

        if fs::try_exists(&path).await? {
            debug!(digest = %digest, "Artefact already stored");
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(digest = %digest, size = content.len(), "Stored artefact");
        Ok(digest)
    }

    async fn get(&self, digest: &str) -> Result<Vec<u8>> {
        check_digest(digest)?;
        let path = self.path_for_digest(digest);
        if !fs::try_exists(&path).await? {
            return Err(ArtefactError::NotFound(digest.to_string()));
        }

        let content = fs::read(&path).await?;
        let actual = super::digest(&content);
        if actual != digest {
            return Err(ArtefactError::IntegrityFailed {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    async fn contains(&self, digest: &str) -> Result<bool> {
        check_digest(digest)?;
        Ok(fs::try_exists(self.path_for_digest(digest)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_temp_store() -> (FilesystemArtefactStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemArtefactStore::new(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, temp) = create_temp_store().await;

        let digest = store.put(b"migration archive").await.unwrap();

        assert_eq!(store.get(&digest).await.unwrap(), b"migration archive");
        assert!(temp
            .path()
            .join(&digest[0..2])
            .join(format!("{}.bin", digest))
            .exists());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (store, _temp) = create_temp_store().await;

        let first = store.put(b"same").await.unwrap();
        let second = store.put(b"same").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (store, _temp) = create_temp_store().await;
        let result = store.get(&super::super::digest(b"never stored")).await;
        assert!(matches!(result, Err(ArtefactError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_detects_corruption() {
        let (store, _temp) = create_temp_store().await;
        let digest = store.put(b"original").await.unwrap();
        std::fs::write(store.path_for_digest(&digest), b"tampered").unwrap();

        let result = store.get(&digest).await;

        assert!(matches!(result, Err(ArtefactError::IntegrityFailed { .. })));
    }
}
