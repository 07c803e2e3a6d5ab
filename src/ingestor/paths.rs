//! Destination path derivation

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("object key is empty")]
    Empty,

    #[error("object key '{0}' contains an empty, '.' or '..' segment")]
    UnsafeSegment(String),
}

/// Join `root` with the object key, keeping the key's directory structure:
/// `alice@example.com/report.pdf` under `/data` becomes
/// `/data/alice@example.com/report.pdf`.
///
/// Keys that would resolve outside `root` are rejected.
pub fn destination_path(root: &Path, object: &str) -> Result<PathBuf, PathError> {
    if object.is_empty() {
        return Err(PathError::Empty);
    }

    let mut dest = root.to_path_buf();
    for segment in object.split('/') {
        if matches!(segment, "" | "." | "..") || segment.contains('\\') {
            return Err(PathError::UnsafeSegment(object.to_string()));
        }
        dest.push(segment);
    }

    Ok(dest)
}

/// Create the parent directory of `dest`. Succeeds when it already exists,
/// including when another task creates it concurrently.
pub async fn ensure_parent(dest: &Path) -> std::io::Result<()> {
    match dest.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}
