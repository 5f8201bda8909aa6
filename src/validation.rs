//! Path normalization and containment checks.
//!
//! Metadata, ledger and backup paths must live strictly outside the watched
//! tree: a state file inside it would feed its own writes back through the
//! watcher. Containment is checked lexically so that paths which do not
//! exist yet (a metadata directory created on first use) can still be
//! validated.

use std::path::{Component, Path, PathBuf};

/// Error types for path validation.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    /// Path resolves inside the watched tree
    #[error("path {0} resolves inside the watched tree {1}")]
    InsideWatchedTree(String, String),

    /// Relative path cannot be anchored (no working directory available)
    #[error("cannot resolve relative path: {0}")]
    CannotResolve(String),
}

/// Normalize a path lexically: anchor relative paths at the current
/// directory, then fold `.` and `..` components without touching the
/// filesystem.
///
/// Unlike `std::fs::canonicalize` this works for paths that do not exist,
/// which is required for validating configured directories before they are
/// created. Symlinks are not resolved; the caller canonicalizes the watched
/// root (which must exist) so symlinked roots still compare correctly.
pub fn normalize_path(path: &Path) -> Result<PathBuf, PathValidationError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|_| PathValidationError::CannotResolve(path.display().to_string()))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Check whether `path` lies inside `root` (or is `root` itself).
///
/// `root` is canonicalized when possible so a symlinked watched root
/// compares against the real location; `path` is normalized lexically.
pub fn is_inside(path: &Path, root: &Path) -> bool {
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    match normalize_path(path) {
        Ok(normalized) => normalized.starts_with(&root),
        Err(_) => false,
    }
}

/// Refuse a configured artefact path that resolves inside the watched tree.
pub fn ensure_outside_root(path: &Path, root: &Path) -> Result<(), PathValidationError> {
    if is_inside(path, root) {
        return Err(PathValidationError::InsideWatchedTree(
            path.display().to_string(),
            root.display().to_string(),
        ));
    }
    Ok(())
}

/// Relative path of `path` under `root`, falling back to the basename when
/// the path lies outside the root.
pub fn relative_to_root(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf()),
    }
}
