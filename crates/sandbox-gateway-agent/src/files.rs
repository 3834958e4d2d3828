//! File and archive application under the agent's work root.

use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

/// Errors applying `file-received` and `zip-received` events
#[derive(Debug, Error)]
pub enum FileError {
    /// The requested path resolves outside the work root
    #[error("Path escapes work root: {0}")]
    Escape(String),
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The archive could not be read
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Resolve `requested` against `root` without leaving it.
///
/// Relative paths are joined to the root. Absolute paths are accepted only
/// when they already point inside the root. Resolution is lexical, `..`
/// components that would climb above the root are rejected.
///
/// # Errors
///
/// Returns `FileError::Escape` when the path would leave the root.
pub fn resolve(root: &Path, requested: &str) -> Result<PathBuf, FileError> {
    let path = Path::new(requested);
    let relative = path.strip_prefix(root).unwrap_or(path);

    let mut resolved = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(FileError::Escape(requested.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FileError::Escape(requested.to_string()));
            }
        }
    }
    Ok(root.join(resolved))
}

/// Write `content` to `path` under `root`, creating parent directories.
///
/// # Errors
///
/// Returns `FileError` if the path escapes the root or the write fails.
pub async fn write_file(root: &Path, path: &str, content: &str) -> Result<PathBuf, FileError> {
    let target = resolve(root, path)?;
    if target == root {
        return Err(FileError::Escape(path.to_string()));
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, content).await?;
    debug!(path = %target.display(), bytes = content.len(), "File written");
    Ok(target)
}

/// Extract a zip archive into `dest` under `root`. Returns the number of
/// files written.
///
/// # Errors
///
/// Returns `FileError` if the destination or any entry escapes the root, the
/// archive is unreadable, or a write fails.
pub async fn extract_zip(root: &Path, dest: &str, bytes: Vec<u8>) -> Result<usize, FileError> {
    let dest = resolve(root, dest)?;
    tokio::task::spawn_blocking(move || extract_blocking(&dest, bytes))
        .await
        .map_err(|e| FileError::Io(io::Error::other(e)))?
}

fn extract_blocking(dest: &Path, bytes: Vec<u8>) -> Result<usize, FileError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    std::fs::create_dir_all(dest)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            return Err(FileError::Escape(entry.name().to_string()));
        };
        let out_path = dest.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }

    debug!(dest = %dest.display(), files = written, "Archive extracted");
    Ok(written)
}
