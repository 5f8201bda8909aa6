//! Conflict detection over three-way file metadata.
//!
//! Compares local and remote versions of a path, optionally against the
//! last synchronized base version, and classifies genuine conflicts. Two
//! files count as identical when their sizes match and either their content
//! hashes agree or their mtimes fall within the configured tolerance;
//! cross-host clocks and copy tools commonly drift by a couple of seconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Content hashing is skipped for files at or above this size to cap
/// detection latency.
pub const HASH_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// Snapshot of one file version on either side.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub exists: bool,
    /// Seconds since the epoch, fractional
    pub mtime: Option<f64>,
    pub size: Option<u64>,
    pub content_hash: Option<String>,
}

impl FileMetadata {
    /// Record for a path that does not exist on this side.
    pub fn missing(path: PathBuf) -> Self {
        Self {
            path,
            exists: false,
            mtime: None,
            size: None,
            content_hash: None,
        }
    }

    /// Snapshot a local file; hashes content only below [`HASH_SIZE_LIMIT`].
    pub fn from_local(path: &Path) -> Self {
        let Ok(meta) = std::fs::metadata(path) else {
            return Self::missing(path.to_path_buf());
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64());

        let size = meta.len();
        let content_hash = if meta.is_file() && size < HASH_SIZE_LIMIT {
            match std::fs::read(path) {
                Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to hash file");
                    None
                }
            }
        } else {
            None
        };

        Self {
            path: path.to_path_buf(),
            exists: true,
            mtime: Some(mtime.unwrap_or(0.0)),
            size: Some(size),
            content_hash,
        }
    }
}

/// Classification of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictKind {
    BothModified,
    LocalDeletedRemoteModified,
    RemoteDeletedLocalModified,
    BothCreated,
    MoveConflict,
}

impl ConflictKind {
    /// The kind produced when local and remote inputs are swapped.
    pub fn mirrored(self) -> Self {
        match self {
            ConflictKind::LocalDeletedRemoteModified => ConflictKind::RemoteDeletedLocalModified,
            ConflictKind::RemoteDeletedLocalModified => ConflictKind::LocalDeletedRemoteModified,
            other => other,
        }
    }
}

/// A conflict between the two sides of one path.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub local: FileMetadata,
    pub remote: FileMetadata,
    pub base: Option<FileMetadata>,
    pub details: String,
    pub detected_at: chrono::DateTime<chrono::Local>,
}

impl Conflict {
    fn new(
        kind: ConflictKind,
        local: &FileMetadata,
        remote: &FileMetadata,
        base: Option<&FileMetadata>,
        details: &str,
    ) -> Self {
        Self {
            kind,
            local: local.clone(),
            remote: remote.clone(),
            base: base.cloned(),
            details: details.to_string(),
            detected_at: chrono::Local::now(),
        }
    }
}

/// Case analysis over (local, remote, base) metadata.
pub struct ConflictDetector {
    tolerance_secs: f64,
    content_hash: bool,
}

impl ConflictDetector {
    pub fn new(tolerance: Duration, content_hash: bool) -> Self {
        Self {
            tolerance_secs: tolerance.as_secs_f64(),
            content_hash,
        }
    }

    /// Detect a conflict for one path, or `None` when one side simply wins.
    pub fn detect(
        &self,
        local: &FileMetadata,
        remote: &FileMetadata,
        base: Option<&FileMetadata>,
    ) -> Option<Conflict> {
        // 1: neither side has the file
        if !local.exists && !remote.exists {
            return None;
        }

        // 2: local exists, remote gone
        if local.exists && !remote.exists {
            if base.map(|b| b.exists).unwrap_or(false) {
                return Some(Conflict::new(
                    ConflictKind::RemoteDeletedLocalModified,
                    local,
                    remote,
                    base,
                    "remote deleted but local modified",
                ));
            }
            // local creation, propagate
            return None;
        }

        // 3: remote exists, local gone
        if !local.exists && remote.exists {
            if base.map(|b| b.exists).unwrap_or(false) {
                return Some(Conflict::new(
                    ConflictKind::LocalDeletedRemoteModified,
                    local,
                    remote,
                    base,
                    "local deleted but remote modified",
                ));
            }
            return None;
        }

        // 4: both exist with no base version: simultaneous creation
        if let Some(base) = base {
            if !base.exists && !self.files_identical(local, remote) {
                return Some(Conflict::new(
                    ConflictKind::BothCreated,
                    local,
                    remote,
                    Some(base),
                    "both sides created different files",
                ));
            }
        }

        // 5: both exist and identical
        if self.files_identical(local, remote) {
            return None;
        }

        // 6: both diverged from the base
        if let Some(base) = base.filter(|b| b.exists) {
            let local_modified = !self.files_identical(local, base);
            let remote_modified = !self.files_identical(remote, base);
            if local_modified && remote_modified {
                return Some(Conflict::new(
                    ConflictKind::BothModified,
                    local,
                    remote,
                    Some(base),
                    "both sides modified the file",
                ));
            }
        }

        // 7: single-side modification, the newer version wins
        None
    }

    /// Whether two versions count as the same file content.
    pub fn files_identical(&self, a: &FileMetadata, b: &FileMetadata) -> bool {
        if a.exists != b.exists {
            return false;
        }
        if !a.exists && !b.exists {
            return true;
        }
        if a.size != b.size {
            return false;
        }

        if let (Some(ma), Some(mb)) = (a.mtime, b.mtime) {
            if (ma - mb).abs() > self.tolerance_secs && !self.content_hash {
                return false;
            }
        }

        if self.content_hash {
            if let (Some(ha), Some(hb)) = (&a.content_hash, &b.content_hash) {
                return ha == hb;
            }
        }

        // no hash available: size plus tolerant mtime is the best we have
        if let (Some(ma), Some(mb)) = (a.mtime, b.mtime) {
            return (ma - mb).abs() <= self.tolerance_secs;
        }
        true
    }

    /// Detect conflicts across keyed metadata maps.
    pub fn detect_batch(
        &self,
        local: &BTreeMap<String, FileMetadata>,
        remote: &BTreeMap<String, FileMetadata>,
        base: Option<&BTreeMap<String, FileMetadata>>,
    ) -> BTreeMap<String, Conflict> {
        let mut conflicts = BTreeMap::new();
        let paths: std::collections::BTreeSet<&String> =
            local.keys().chain(remote.keys()).collect();

        for path in paths {
            let local_meta = local
                .get(path)
                .cloned()
                .unwrap_or_else(|| FileMetadata::missing(PathBuf::from(path)));
            let remote_meta = remote
                .get(path)
                .cloned()
                .unwrap_or_else(|| FileMetadata::missing(PathBuf::from(path)));
            let base_meta = base.and_then(|b| b.get(path));

            if let Some(conflict) = self.detect(&local_meta, &remote_meta, base_meta) {
                conflicts.insert(path.clone(), conflict);
            }
        }

        conflicts
    }
}
