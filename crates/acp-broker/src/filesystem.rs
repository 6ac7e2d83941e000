//! `readTextFile`/`writeTextFile` request handling for the inbound router.
//!
//! ## Responsibilities
//! - Resolve a path the agent sends against the owning session's `cwd`.
//! - Reject any path that resolves outside that `cwd`, reported to the
//!   agent as a protocol error rather than surfaced to a subscriber.
//!
//! ## Design Principles
//! - Single Responsibility: pure path resolution plus the two file
//!   operations, no session bookkeeping.

use std::path::{Path, PathBuf};

use crate::error::{BrokerError, Result};

/// Resolve `requested` against `cwd`, rejecting escapes.
///
/// The root is a single dynamic value (the session's `cwd`) rather than a
/// static list: relative paths are
/// joined onto `cwd`; absolute paths are accepted only when already inside
/// `cwd`. Resolution is textual (`..` components are rejected outright)
/// rather than `canonicalize`-based, since the target file may not exist
/// yet on a write.
pub fn resolve_path(cwd: &Path, requested: &Path) -> Result<PathBuf> {
    if requested
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BrokerError::PathTraversal);
    }

    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        cwd.join(requested)
    };

    if !candidate.starts_with(cwd) {
        return Err(BrokerError::PathTraversal);
    }

    Ok(candidate)
}

pub async fn read_text_file(cwd: &Path, requested: &Path) -> Result<String> {
    let path = resolve_path(cwd, requested)?;
    Ok(tokio::fs::read_to_string(path).await?)
}

pub async fn write_text_file(cwd: &Path, requested: &Path, content: &str) -> Result<()> {
    let path = resolve_path(cwd, requested)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
