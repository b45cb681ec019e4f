//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! keep best-effort removal logging in one place.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// Size of a regular file, or `None` if it does not exist or is not a file.
pub async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Remove a file or directory tree. Missing paths count as removed.
///
/// Returns `true` if something was deleted.
pub async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove every path, logging each outcome. Failures are never escalated.
pub async fn cleanup_paths<P: AsRef<Path>>(job_id: &str, paths: &[P]) {
    for path in paths {
        let path = path.as_ref();
        match remove_path(path).await {
            Ok(true) => info!(job_id = %job_id, path = %path.display(), "Cleaned up"),
            Ok(false) => debug!(job_id = %job_id, path = %path.display(), "Nothing to clean up"),
            Err(e) => {
                warn!(job_id = %job_id, path = %path.display(), error = %e, "Failed to clean up")
            }
        }
    }
}

/// Collect owned copies of the given paths, skipping `None`.
pub fn owned_paths<'a>(paths: impl IntoIterator<Item = Option<&'a Path>>) -> Vec<PathBuf> {
    paths.into_iter().flatten().map(Path::to_path_buf).collect()
}
