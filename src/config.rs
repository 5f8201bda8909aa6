//! Typed configuration model and startup validation.
//!
//! The core consumes a fully built [`Config`]; the concrete loader shipped
//! with the binary reads a JSON document (`Config::from_file`). Validation
//! failures here are fatal: the engine refuses to start on a missing watch
//! path, a malformed remote, or any artefact path that resolves inside the
//! watched tree.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bidir::resolve::ResolutionStrategy;
use crate::validation;

/// Configuration errors, all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("watch path {0} must be absolute")]
    RelativeWatchPath(PathBuf),

    #[error("watch path {0} does not exist or is not a directory")]
    BadWatchPath(PathBuf),

    #[error("no remotes configured")]
    NoRemotes,

    #[error("remote {0}: {1}")]
    BadRemote(String, String),

    #[error("{label} path {path} must live outside the watched tree {root}")]
    InsideWatchedTree {
        label: &'static str,
        path: PathBuf,
        root: PathBuf,
    },

    #[error("auth enabled but password file {0} is not readable")]
    BadPasswordFile(PathBuf),

    #[error("cannot create metadata directory {path}: {source}")]
    MetadataDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Replication direction for a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Push-only: local changes propagate to the remote
    OneWay,
    /// Reconciled both ways through the peer reconciler
    TwoWay,
}

/// One rsync endpoint, immutable for the run.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Host address (daemon or SSH target)
    pub addr: String,
    /// rsync module name (daemon mode) or remote path segment (SSH mode)
    pub module: String,
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: ResolutionStrategy,
    /// Seconds between bidirectional reconcile sweeps
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Stable node identifier override (generated and persisted when unset)
    #[serde(default)]
    pub node_id: Option<String>,
    /// Metadata directory override (validated against the watched tree)
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    /// Conflict backup directory override
    #[serde(default)]
    pub conflict_backup_dir: Option<PathBuf>,
    /// Lock file override
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

impl RemoteConfig {
    /// Display form used in logs and ledger comments.
    pub fn display_name(&self) -> String {
        format!("{}::{}", self.addr, self.module)
    }
}

/// rsync invocation settings shared by all remotes.
#[derive(Debug, Clone, Deserialize)]
pub struct RsyncConfig {
    /// Transfer tool binary (overridable so tests can stub it)
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Fixed common flags, whitespace-separated
    #[serde(default = "default_common_params")]
    pub common_params: String,
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub auth_users: Option<String>,
    #[serde(default)]
    pub auth_password_file: Option<PathBuf>,
    #[serde(default)]
    pub custom_port_enabled: bool,
    #[serde(default = "default_port")]
    pub custom_port: u16,
    #[serde(default)]
    pub timeout_enabled: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub ssh_enabled: bool,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            common_params: default_common_params(),
            auth_enabled: false,
            auth_users: None,
            auth_password_file: None,
            custom_port_enabled: false,
            custom_port: default_port(),
            timeout_enabled: false,
            timeout_secs: default_timeout(),
            ssh_enabled: false,
        }
    }
}

/// Which event kinds the watcher reports.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMask {
    #[serde(default = "default_true")]
    pub delete: bool,
    #[serde(default = "default_true")]
    pub create_folder: bool,
    #[serde(default)]
    pub create_file: bool,
    #[serde(default = "default_true")]
    pub close_write: bool,
    #[serde(default = "default_true")]
    pub moved_from: bool,
    #[serde(default = "default_true")]
    pub moved_to: bool,
    #[serde(default)]
    pub attrib: bool,
    #[serde(default)]
    pub modify: bool,
}

impl Default for EventMask {
    fn default() -> Self {
        Self {
            delete: true,
            create_folder: true,
            create_file: false,
            close_write: true,
            moved_from: true,
            moved_to: true,
            attrib: false,
            modify: false,
        }
    }
}

/// User-defined filter patterns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Failure ledger location and retry cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct FailLogConfig {
    #[serde(default = "default_faillog_path")]
    pub path: PathBuf,
    /// Seconds between retry-script executions
    #[serde(default = "default_faillog_interval")]
    pub time_to_execute_secs: u64,
}

impl Default for FailLogConfig {
    fn default() -> Self {
        Self {
            path: default_faillog_path(),
            time_to_execute_secs: default_faillog_interval(),
        }
    }
}

/// Periodic full-replication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrontabConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_schedule")]
    pub schedule_minutes: u64,
    /// Exclude patterns forwarded to the transfer tool
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

/// Bidirectional reconciliation settings shared by all two-way remotes.
#[derive(Debug, Clone, Deserialize)]
pub struct BidirConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metadata_base")]
    pub metadata_base_dir: PathBuf,
    #[serde(default = "default_true")]
    pub enable_conflict_backup: bool,
    #[serde(default = "default_max_backups")]
    pub max_conflict_backups: usize,
    /// Clock tolerance when comparing mtimes across hosts
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance_secs: u64,
    #[serde(default = "default_true")]
    pub content_hash: bool,
    /// SSH user for the peer reconciler
    #[serde(default)]
    pub peer_user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub peer_ssh_port: u16,
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,
}

impl Default for BidirConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metadata_base_dir: default_metadata_base(),
            enable_conflict_backup: true,
            max_conflict_backups: default_max_backups(),
            time_tolerance_secs: default_time_tolerance(),
            content_hash: true,
            peer_user: None,
            peer_ssh_port: default_ssh_port(),
            reconcile_timeout_secs: default_reconcile_timeout(),
        }
    }
}

/// Coalescing window and output FIFO bound.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            capacity: default_capacity(),
        }
    }
}

/// Top-level configuration consumed by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Absolute directory to replicate
    pub watch_path: PathBuf,
    pub remotes: Vec<RemoteConfig>,
    #[serde(default)]
    pub rsync: RsyncConfig,
    #[serde(default)]
    pub event_mask: EventMask,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub fail_log: FailLogConfig,
    #[serde(default)]
    pub crontab: CrontabConfig,
    #[serde(default)]
    pub bidirectional: BidirConfig,
    #[serde(default = "default_workers")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; any error here aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.watch_path.is_absolute() {
            return Err(ConfigError::RelativeWatchPath(self.watch_path.clone()));
        }
        if !self.watch_path.is_dir() {
            return Err(ConfigError::BadWatchPath(self.watch_path.clone()));
        }
        if self.remotes.is_empty() {
            return Err(ConfigError::NoRemotes);
        }
        for remote in &self.remotes {
            if remote.addr.is_empty() {
                return Err(ConfigError::BadRemote(
                    remote.display_name(),
                    "empty address".to_string(),
                ));
            }
            if remote.module.is_empty() {
                return Err(ConfigError::BadRemote(
                    remote.display_name(),
                    "empty module".to_string(),
                ));
            }
            for (label, path) in [
                ("metadata_dir", &remote.metadata_dir),
                ("conflict_backup_dir", &remote.conflict_backup_dir),
                ("lock_file", &remote.lock_file),
            ] {
                if let Some(path) = path {
                    self.ensure_outside(label, path)?;
                }
            }
        }

        self.ensure_outside("fail_log", &self.fail_log.path)?;
        if self.bidirectional.enabled {
            self.ensure_outside("metadata_base_dir", &self.bidirectional.metadata_base_dir)?;
        }

        if self.rsync.auth_enabled {
            match &self.rsync.auth_password_file {
                Some(file) if file.is_file() => {}
                Some(file) => return Err(ConfigError::BadPasswordFile(file.clone())),
                None => return Err(ConfigError::BadPasswordFile(PathBuf::new())),
            }
        }

        Ok(())
    }

    fn ensure_outside(&self, label: &'static str, path: &Path) -> Result<(), ConfigError> {
        validation::ensure_outside_root(path, &self.watch_path).map_err(|_| {
            ConfigError::InsideWatchedTree {
                label,
                path: path.to_path_buf(),
                root: self.watch_path.clone(),
            }
        })
    }

    /// Remotes participating in bidirectional reconciliation.
    pub fn two_way_remotes(&self) -> impl Iterator<Item = &RemoteConfig> {
        self.remotes
            .iter()
            .filter(|r| matches!(r.mode, SyncMode::TwoWay))
    }
}

fn default_sync_mode() -> SyncMode {
    SyncMode::OneWay
}

fn default_conflict_strategy() -> ResolutionStrategy {
    ResolutionStrategy::KeepNewer
}

fn default_sync_interval() -> u64 {
    60
}

fn default_tool() -> String {
    "rsync".to_string()
}

fn default_common_params() -> String {
    "-artuz".to_string()
}

fn default_port() -> u16 {
    874
}

fn default_timeout() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_faillog_path() -> PathBuf {
    PathBuf::from("/tmp/rsync_fail_log.sh")
}

fn default_faillog_interval() -> u64 {
    60
}

fn default_schedule() -> u64 {
    600
}

fn default_metadata_base() -> PathBuf {
    PathBuf::from("/var/driftsync/bidirectional")
}

fn default_max_backups() -> usize {
    10
}

fn default_time_tolerance() -> u64 {
    2
}

fn default_ssh_port() -> u16 {
    22
}

fn default_reconcile_timeout() -> u64 {
    3600
}

fn default_window() -> u64 {
    5
}

fn default_capacity() -> usize {
    10_000
}

fn default_workers() -> usize {
    10
}
