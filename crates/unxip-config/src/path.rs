//! Path resolution for command-line inputs.
//!
//! The archive path and the destination directory are resolved once, up
//! front, so later errors can name absolute paths.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the archive path to an absolute path of an existing file.
///
/// # Example
/// ```ignore
/// let archive = resolve_input("Xcode_16.xip")?;
/// assert!(archive.is_absolute());
/// ```
pub fn resolve_input(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Cannot resolve archive: {}", path.display()))?;
    if !canonical.is_file() {
        anyhow::bail!("Archive '{}' is not a regular file", path.display());
    }
    Ok(canonical)
}

/// Create the destination directory if needed and return its absolute path.
pub fn prepare_destination(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .with_context(|| format!("Cannot create destination: {}", path.display()))?;
    path.canonicalize()
        .with_context(|| format!("Cannot resolve destination: {}", path.display()))
}

/// Normalize path, falling back to the original if canonicalization fails.
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
