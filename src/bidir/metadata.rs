//! Per-(watched root, remote) metadata store.
//!
//! State lives under `<base>/<slug>/{state,conflicts,sync.lock}` where the
//! slug is derived from the root/remote pair, so several replications can
//! share one base directory without colliding. Every location is validated
//! to sit outside the watched tree; a state file inside it would loop its
//! own writes back through the watcher. The sync-state document is written
//! atomically (temp file in the same directory, then rename) so readers
//! never observe a truncated JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigError;
use crate::filter::EventFilter;
use crate::validation;

use super::detect::FileMetadata;

/// Optional user overrides for the store layout.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub state_dir: Option<PathBuf>,
    pub conflict_dir: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
}

/// Recorded state of one file at last synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub mtime: f64,
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    pub last_modified_by: String,
    pub updated_at: String,
}

impl FileState {
    /// View this record as file metadata for the conflict detector.
    pub fn to_metadata(&self, rel_path: &str) -> FileMetadata {
        FileMetadata {
            path: PathBuf::from(rel_path),
            exists: true,
            mtime: Some(self.mtime),
            size: Some(self.size),
            content_hash: self.checksum.clone(),
        }
    }
}

/// The persistent sync-state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub node_id: String,
    pub version: u64,
    pub created: String,
    pub last_updated: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub last_sync: Option<String>,
}

/// Store statistics for logs and the dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataStats {
    pub node_id: String,
    pub version: u64,
    pub files_tracked: usize,
    pub last_updated: String,
    pub conflict_backups: usize,
}

/// Filesystem-backed metadata store for one (root, remote) pair.
pub struct MetadataStore {
    watch_path: PathBuf,
    state_dir: PathBuf,
    conflict_dir: PathBuf,
    lock_file: PathBuf,
    node_id: String,
}

impl MetadataStore {
    /// Build the store, creating its directories and node id on first use.
    ///
    /// Fails with a configuration error when any location, default or
    /// overridden, resolves inside the watched tree.
    pub fn new(
        watch_path: &Path,
        remote_name: &str,
        base_dir: &Path,
        overrides: &MetadataOverrides,
        preferred_node_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let watch_path =
            std::fs::canonicalize(watch_path).unwrap_or_else(|_| watch_path.to_path_buf());

        let slug = derive_slug(&watch_path, remote_name);
        let slug_dir = base_dir.join(&slug);

        let state_dir = overrides
            .state_dir
            .clone()
            .unwrap_or_else(|| slug_dir.join("state"));
        let conflict_dir = overrides
            .conflict_dir
            .clone()
            .unwrap_or_else(|| slug_dir.join("conflicts"));
        let lock_file = overrides
            .lock_file
            .clone()
            .unwrap_or_else(|| slug_dir.join("sync.lock"));

        for (label, path) in [
            ("metadata_dir", &state_dir),
            ("conflict_backup_dir", &conflict_dir),
            ("lock_file", &lock_file),
        ] {
            validation::ensure_outside_root(path, &watch_path).map_err(|_| {
                ConfigError::InsideWatchedTree {
                    label,
                    path: path.clone(),
                    root: watch_path.clone(),
                }
            })?;
        }

        for dir in [&state_dir, &conflict_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::MetadataDir {
                path: dir.clone(),
                source,
            })?;
        }

        let node_id = load_or_create_node_id(&state_dir, preferred_node_id);

        tracing::info!(
            watch_path = %watch_path.display(),
            remote = remote_name,
            node_id = %node_id,
            state_dir = %state_dir.display(),
            "metadata store initialized"
        );

        Ok(Self {
            watch_path,
            state_dir,
            conflict_dir,
            lock_file,
            node_id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("sync_state.json")
    }

    pub fn conflict_dir(&self) -> &Path {
        &self.conflict_dir
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_file
    }

    pub fn watch_path(&self) -> &Path {
        &self.watch_path
    }

    /// Load the sync state, rebuilding an empty one when the file is
    /// absent or malformed.
    pub fn load(&self) -> SyncState {
        let state_file = self.state_file();
        if !state_file.exists() {
            return self.initial_state();
        }

        match std::fs::read_to_string(&state_file)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<SyncState>(&raw).map_err(|e| e.to_string()))
        {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    file = %state_file.display(),
                    error = %err,
                    "sync state unreadable, starting from empty state"
                );
                self.initial_state()
            }
        }
    }

    /// Persist the state atomically, bumping version and timestamp.
    pub fn save(&self, state: &mut SyncState) -> std::io::Result<()> {
        state.last_updated = now_iso();
        state.version += 1;

        let state_file = self.state_file();
        // temp file in the same directory so the rename stays on one filesystem
        let temp = tempfile::NamedTempFile::new_in(&self.state_dir)?;
        serde_json::to_writer_pretty(&temp, state)?;
        temp.persist(&state_file).map_err(|e| e.error)?;

        tracing::debug!(
            version = state.version,
            files = state.files.len(),
            "sync state saved"
        );
        Ok(())
    }

    /// Record or update one file's synchronized state.
    pub fn update_file(
        &self,
        rel_path: &str,
        mtime: f64,
        size: u64,
        checksum: Option<String>,
    ) -> std::io::Result<()> {
        let mut state = self.load();
        state.files.insert(
            rel_path.to_string(),
            FileState {
                mtime,
                size,
                checksum,
                last_modified_by: self.node_id.clone(),
                updated_at: now_iso(),
            },
        );
        self.save(&mut state)
    }

    /// Drop one file's record, if present.
    pub fn remove_file(&self, rel_path: &str) -> std::io::Result<()> {
        let mut state = self.load();
        if state.files.remove(rel_path).is_some() {
            self.save(&mut state)?;
        }
        Ok(())
    }

    /// Recorded state for one file.
    pub fn file_state(&self, rel_path: &str) -> Option<FileState> {
        self.load().files.get(rel_path).cloned()
    }

    /// Write raw conflicting content into the conflicts directory.
    pub fn conflict_backup(&self, file_name: &str, content: &[u8]) -> std::io::Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_name = format!("{}.conflict.{}.{}", file_name, timestamp, self.node_id);
        let backup_path = self.conflict_dir.join(backup_name);
        std::fs::write(&backup_path, content)?;

        tracing::info!(
            file = file_name,
            backup = %backup_path.display(),
            "conflict backup created"
        );
        Ok(backup_path)
    }

    /// Keep the `max_backups` newest conflict artefacts, delete the rest.
    pub fn rotate_backups(&self, max_backups: usize) {
        let Ok(entries) = std::fs::read_dir(&self.conflict_dir) else {
            return;
        };

        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().contains(".conflict."))
            .filter_map(|entry| {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((mtime, entry.path()))
            })
            .collect();

        backups.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in backups.into_iter().skip(max_backups) {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove old backup");
            } else {
                tracing::debug!(path = %path.display(), "removed old conflict backup");
            }
        }
    }

    /// Rebuild file records from the current tree contents.
    ///
    /// Used to seed the store on first start and to refresh bookkeeping
    /// after a reconcile. Returns the number of files recorded.
    pub fn refresh_from_disk(&self, filter: Option<&EventFilter>) -> std::io::Result<usize> {
        let mut state = self.load();
        state.files.clear();

        for entry in walkdir::WalkDir::new(&self.watch_path)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if filter.map(|f| f.should_ignore(path)).unwrap_or(false) {
                continue;
            }
            let rel = validation::relative_to_root(path, &self.watch_path);
            let meta = FileMetadata::from_local(path);
            state.files.insert(
                rel.to_string_lossy().into_owned(),
                FileState {
                    mtime: meta.mtime.unwrap_or(0.0),
                    size: meta.size.unwrap_or(0),
                    checksum: meta.content_hash,
                    last_modified_by: self.node_id.clone(),
                    updated_at: now_iso(),
                },
            );
        }

        let count = state.files.len();
        state.last_sync = Some(now_iso());
        self.save(&mut state)?;
        Ok(count)
    }

    pub fn stats(&self) -> MetadataStats {
        let state = self.load();
        let conflict_backups = std::fs::read_dir(&self.conflict_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().contains(".conflict."))
                    .count()
            })
            .unwrap_or(0);

        MetadataStats {
            node_id: self.node_id.clone(),
            version: state.version,
            files_tracked: state.files.len(),
            last_updated: state.last_updated,
            conflict_backups,
        }
    }

    fn initial_state(&self) -> SyncState {
        SyncState {
            node_id: self.node_id.clone(),
            version: 1,
            created: now_iso(),
            last_updated: now_iso(),
            files: BTreeMap::new(),
            last_sync: None,
        }
    }
}

/// 8-hex-digit namespace slug for a (root, remote) pair.
pub fn derive_slug(watch_path: &Path, remote_name: &str) -> String {
    let unique = format!("{}:{}", watch_path.display(), remote_name);
    hex::encode(Sha256::digest(unique.as_bytes()))[..8].to_string()
}

fn load_or_create_node_id(state_dir: &Path, preferred: Option<String>) -> String {
    let node_id_file = state_dir.join("node_id");
    if let Ok(existing) = std::fs::read_to_string(&node_id_file) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return existing.to_string();
        }
    }

    let node_id = preferred
        .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    if let Err(err) = std::fs::write(&node_id_file, &node_id) {
        tracing::warn!(error = %err, "failed to persist node id");
    }
    node_id
}

fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}
