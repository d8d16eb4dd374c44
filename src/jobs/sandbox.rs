//! Path sandbox.
//!
//! All job output lands under the configured data root. Requested output
//! directories are validated lexically first (absolute paths, `..` segments
//! and NUL bytes are rejected) and, when the target already exists, via
//! realpath so symlinks cannot escape the root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("output_dir must be relative")]
    Absolute,
    #[error("output_dir must not contain NUL bytes")]
    NulByte,
    #[error("output_dir must not contain '..' segments")]
    Traversal,
    #[error("output_dir escapes the data root")]
    Escape,
    #[error("data root is unavailable: {0}")]
    RootUnavailable(String),
}

/// Lexical validation used at the admission boundary, before any filesystem
/// access. Accepts `.` segments (dropped during normalization).
pub fn validate_relative(requested: &str) -> Result<(), SandboxError> {
    if requested.contains('\0') {
        return Err(SandboxError::NulByte);
    }
    let path = Path::new(requested);
    if path.is_absolute() {
        return Err(SandboxError::Absolute);
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(SandboxError::Traversal),
            Component::RootDir | Component::Prefix(_) => return Err(SandboxError::Absolute),
        }
    }
    Ok(())
}

/// Lexically normalize a validated relative path: drop `.` segments.
fn normalize(requested: &str) -> PathBuf {
    Path::new(requested)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Resolve a requested output directory against the sandbox root.
///
/// Returns the absolute final path. When the target (or the root) already
/// exists on disk, realpath comparison guards against symlink escapes.
pub fn resolve_output_dir(data_root: &Path, requested: &str) -> Result<PathBuf, SandboxError> {
    validate_relative(requested)?;
    let normalized = normalize(requested);
    let resolved = data_root.join(&normalized);

    if resolved.exists() {
        let canonical_root = data_root
            .canonicalize()
            .map_err(|e| SandboxError::RootUnavailable(e.to_string()))?;
        let canonical = resolved
            .canonicalize()
            .map_err(|e| SandboxError::RootUnavailable(e.to_string()))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(SandboxError::Escape);
        }
    }

    Ok(resolved)
}
