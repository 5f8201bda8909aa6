//! driftsync: real-time directory replicator.
//!
//! driftsync observes a directory tree, coalesces filesystem events inside
//! a sliding window, and drives rsync to propagate changes to one or more
//! remote endpoints. Failed transfers are recorded in an executable retry
//! ledger; an optional bidirectional mode reconciles against a peer.

pub mod bidir;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod faillog;
pub mod filter;
pub mod queue;
pub mod scheduler;
pub mod validation;
pub mod watcher;

pub use bidir::coordinator::{Coordinator, CoordinatorState, CoordinatorStats, RunState};
pub use bidir::detect::{Conflict, ConflictDetector, ConflictKind, FileMetadata};
pub use bidir::metadata::{FileState, MetadataOverrides, MetadataStore, SyncState};
pub use bidir::reconciler::{ForceDirection, PeerReconciler, ReconcileOutcome, ReconcilerProfile};
pub use bidir::remote::RemoteStatePoller;
pub use bidir::resolve::{ConflictResolver, Resolution, ResolutionStrategy};
pub use bidir::{ChangeKind, Side, SyncEvent};
pub use config::{
    BidirConfig, Config, ConfigError, CrontabConfig, EventMask, FailLogConfig, FilterConfig,
    QueueConfig, RemoteConfig, RsyncConfig, SyncMode,
};
pub use dispatch::{CommandPlan, Dispatcher, DispatcherStats, EventOutcome, RemoteOutcome};
pub use engine::{BroadcastHandle, Engine, StatsSnapshot};
pub use events::{Event, EventKind, MergedEvent};
pub use faillog::{FailureLedger, LedgerEntry, LedgerExecutor};
pub use filter::{EventFilter, FilterStats};
pub use queue::{EventQueue, QueueStats};
pub use validation::{ensure_outside_root, is_inside, normalize_path, relative_to_root};
pub use watcher::{EventTranslator, FsWatcher};
