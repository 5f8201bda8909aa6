//! Conflict resolution strategies.
//!
//! Strategies are tagged variants applied by case analysis; every
//! resolution records which side won and where the losing version was
//! backed up, if backups are enabled. `Manual` consults a configured
//! handler for a concrete strategy and falls back to backing up both sides
//! when no handler is available or the handler fails to decide.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::detect::{Conflict, FileMetadata};
use super::Side;

/// How a conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the side with the newer mtime
    KeepNewer,
    /// Keep the side with the older mtime
    KeepOlder,
    /// Keep the larger file
    KeepLarger,
    /// Always keep the local version
    KeepLocal,
    /// Always keep the remote version
    KeepRemote,
    /// Preserve both versions in the backup directory
    BackupBoth,
    /// Delegate to the manual handler
    Manual,
    /// Leave the path alone
    Skip,
}

impl ResolutionStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepNewer => "keep_newer",
            ResolutionStrategy::KeepOlder => "keep_older",
            ResolutionStrategy::KeepLarger => "keep_larger",
            ResolutionStrategy::KeepLocal => "keep_local",
            ResolutionStrategy::KeepRemote => "keep_remote",
            ResolutionStrategy::BackupBoth => "backup_both",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::Skip => "skip",
        }
    }
}

/// Outcome of applying a strategy to one conflict.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub success: bool,
    pub strategy_used: ResolutionStrategy,
    pub description: String,
    pub backups: BTreeMap<Side, PathBuf>,
    pub resolved_at: chrono::DateTime<chrono::Local>,
}

impl Resolution {
    fn ok(strategy: ResolutionStrategy, description: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy_used: strategy,
            description: description.into(),
            backups: BTreeMap::new(),
            resolved_at: chrono::Local::now(),
        }
    }

    fn with_backup(mut self, side: Side, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.backups.insert(side, path);
        }
        self
    }
}

/// Callback consulted by the `Manual` strategy.
pub type ManualHandler = Box<dyn Fn(&Conflict) -> ResolutionStrategy + Send + Sync>;

/// Applies resolution strategies and manages conflict backups.
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
    backup_dir: PathBuf,
    enable_backup: bool,
    manual_handler: Option<ManualHandler>,
}

impl ConflictResolver {
    pub fn new(
        default_strategy: ResolutionStrategy,
        backup_dir: PathBuf,
        enable_backup: bool,
        manual_handler: Option<ManualHandler>,
    ) -> Self {
        Self {
            default_strategy,
            backup_dir,
            enable_backup,
            manual_handler,
        }
    }

    /// Apply `strategy` (or the default) to one conflict.
    pub fn resolve(&self, conflict: &Conflict, strategy: Option<ResolutionStrategy>) -> Resolution {
        let strategy = strategy.unwrap_or(self.default_strategy);

        tracing::info!(
            kind = ?conflict.kind,
            path = %conflict.local.path.display(),
            strategy = strategy.label(),
            "resolving conflict"
        );

        match strategy {
            ResolutionStrategy::KeepNewer => self.resolve_keep_newer(conflict),
            ResolutionStrategy::KeepOlder => self.resolve_keep_older(conflict),
            ResolutionStrategy::KeepLarger => self.resolve_keep_larger(conflict),
            ResolutionStrategy::KeepLocal => self.resolve_keep_local(conflict),
            ResolutionStrategy::KeepRemote => self.resolve_keep_remote(conflict),
            ResolutionStrategy::BackupBoth => self.resolve_backup_both(conflict),
            ResolutionStrategy::Manual => self.resolve_manual(conflict),
            ResolutionStrategy::Skip => {
                Resolution::ok(ResolutionStrategy::Skip, "skipped synchronization")
            }
        }
    }

    /// Apply one strategy across a map of conflicts.
    pub fn resolve_batch(
        &self,
        conflicts: &BTreeMap<String, Conflict>,
        strategy: Option<ResolutionStrategy>,
    ) -> BTreeMap<String, Resolution> {
        let results: BTreeMap<String, Resolution> = conflicts
            .iter()
            .map(|(path, conflict)| (path.clone(), self.resolve(conflict, strategy)))
            .collect();

        let successful = results.values().filter(|r| r.success).count();
        tracing::info!(
            total = results.len(),
            successful,
            "batch conflict resolution completed"
        );
        results
    }

    fn resolve_keep_newer(&self, conflict: &Conflict) -> Resolution {
        let strategy = ResolutionStrategy::KeepNewer;
        if !conflict.local.exists {
            return Resolution::ok(strategy, "use remote (local deleted)");
        }
        if !conflict.remote.exists {
            return Resolution::ok(strategy, "use local (remote deleted)");
        }

        match (conflict.local.mtime, conflict.remote.mtime) {
            (Some(local), Some(remote)) if local > remote => {
                Resolution::ok(strategy, "use local (newer)")
                    .with_backup(Side::Remote, self.backup_file(&conflict.remote, Side::Remote))
            }
            (Some(_), Some(_)) => Resolution::ok(strategy, "use remote (newer)")
                .with_backup(Side::Local, self.backup_file(&conflict.local, Side::Local)),
            // mtimes unknown on at least one side
            _ => Resolution::ok(strategy, "use local (default)"),
        }
    }

    fn resolve_keep_older(&self, conflict: &Conflict) -> Resolution {
        let strategy = ResolutionStrategy::KeepOlder;
        match (conflict.local.mtime, conflict.remote.mtime) {
            (Some(local), Some(remote)) if local < remote => {
                Resolution::ok(strategy, "use local (older)")
            }
            (Some(_), Some(_)) => Resolution::ok(strategy, "use remote (older)"),
            _ => Resolution::ok(strategy, "use local (default)"),
        }
    }

    fn resolve_keep_larger(&self, conflict: &Conflict) -> Resolution {
        let strategy = ResolutionStrategy::KeepLarger;
        match (conflict.local.size, conflict.remote.size) {
            (Some(local), Some(remote)) if local > remote => {
                Resolution::ok(strategy, format!("use local (larger: {} bytes)", local))
            }
            (Some(_), Some(remote)) => {
                Resolution::ok(strategy, format!("use remote (larger: {} bytes)", remote))
            }
            _ => Resolution::ok(strategy, "use local (default)"),
        }
    }

    fn resolve_keep_local(&self, conflict: &Conflict) -> Resolution {
        Resolution::ok(ResolutionStrategy::KeepLocal, "use local (policy)").with_backup(
            Side::Remote,
            self.backup_file(&conflict.remote, Side::Remote),
        )
    }

    fn resolve_keep_remote(&self, conflict: &Conflict) -> Resolution {
        Resolution::ok(ResolutionStrategy::KeepRemote, "use remote (policy)").with_backup(
            Side::Local,
            self.backup_file(&conflict.local, Side::Local),
        )
    }

    fn resolve_backup_both(&self, conflict: &Conflict) -> Resolution {
        Resolution::ok(
            ResolutionStrategy::BackupBoth,
            format!("backed up both versions to {}", self.backup_dir.display()),
        )
        .with_backup(Side::Local, self.backup_file(&conflict.local, Side::Local))
        .with_backup(Side::Remote, self.backup_file(&conflict.remote, Side::Remote))
    }

    fn resolve_manual(&self, conflict: &Conflict) -> Resolution {
        if let Some(handler) = &self.manual_handler {
            let chosen = handler(conflict);
            if chosen != ResolutionStrategy::Manual {
                return self.resolve(conflict, Some(chosen));
            }
            tracing::warn!("manual handler returned manual, falling back to backup_both");
        }
        self.resolve_backup_both(conflict)
    }

    /// Copy one side's file into the backup directory.
    ///
    /// Returns `None` when backups are disabled, the version does not exist
    /// on this host, or the copy fails (logged, not fatal).
    fn backup_file(&self, meta: &FileMetadata, side: Side) -> Option<PathBuf> {
        if !self.enable_backup || !meta.exists {
            return None;
        }
        if let Err(err) = std::fs::create_dir_all(&self.backup_dir) {
            tracing::error!(error = %err, "failed to create backup directory");
            return None;
        }

        let backup_path = self.backup_dir.join(backup_name(&meta.path, side));
        match std::fs::copy(&meta.path, &backup_path) {
            Ok(_) => {
                tracing::info!(
                    source = %meta.path.display(),
                    backup = %backup_path.display(),
                    "conflict version backed up"
                );
                Some(backup_path)
            }
            Err(err) => {
                tracing::error!(
                    path = %meta.path.display(),
                    error = %err,
                    "failed to back up conflict version"
                );
                None
            }
        }
    }
}

/// `<stem>_<side>_<timestamp><ext>` backup file name.
fn backup_name(path: &Path, side: Side) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "conflict".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}_{}_{}{}", stem, side, timestamp, ext)
}
