//! Extraction of untrusted migration archives.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::provisioner::HandlerError;

/// Largest single entry accepted from an archive.
pub const MAX_ENTRY_SIZE: u64 = 10 * 1024 * 1024;

/// Relative path of an entry, rejecting anything that could leave the root.
fn sanitize(path: &Path) -> Result<PathBuf, HandlerError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(HandlerError::Archive(format!(
                    "entry {} escapes the archive root",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Extract a tar archive into a fresh temporary directory.
///
/// Only regular files and directories are extracted; links are rejected.
/// Blocking; call from a blocking task.
pub fn extract(archive: &[u8], max_entry_size: u64) -> Result<TempDir, HandlerError> {
    let archive_err = |e: std::io::Error| HandlerError::Archive(e.to_string());
    let root = TempDir::new().map_err(archive_err)?;
    let mut tar = tar::Archive::new(archive);

    for entry in tar.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let raw = entry.path().map_err(archive_err)?.into_owned();
        let relative = sanitize(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = root.path().join(&relative);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(archive_err)?;
            continue;
        }
        if !entry_type.is_file() {
            return Err(HandlerError::Archive(format!(
                "entry {} is not a regular file",
                raw.display()
            )));
        }
        let size = entry.header().size().map_err(archive_err)?;
        if size > max_entry_size {
            return Err(HandlerError::Archive(format!(
                "entry {} is {} bytes, limit is {}",
                raw.display(),
                size,
                max_entry_size
            )));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(archive_err)?;
        }
        // The header size can lie; never read more than the limit.
        let mut content = Vec::new();
        (&mut entry)
            .take(max_entry_size + 1)
            .read_to_end(&mut content)
            .map_err(archive_err)?;
        if content.len() as u64 > max_entry_size {
            return Err(HandlerError::Archive(format!(
                "entry {} exceeds {} bytes",
                raw.display(),
                max_entry_size
            )));
        }
        std::fs::write(&target, content).map_err(archive_err)?;
    }
    Ok(root)
}
