//! Bidirectional coordinator for one two-way remote.
//!
//! Merges the local merged-event stream (tee'd in by the engine workers)
//! with the remote change stream from the state poller into one keyed
//! buffer. On each buffer flush, paths touched on both sides go through the
//! conflict detector and resolver, then a single reconcile pass runs.
//! Reconciling is non-reentrant: a mutex serializes passes, and a lock file
//! next to the metadata signals an active reconcile to outside observers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{BidirConfig, RemoteConfig, RsyncConfig};
use crate::events::MergedEvent;
use crate::validation;

use super::detect::{Conflict, ConflictDetector, ConflictKind, FileMetadata};
use super::metadata::{MetadataOverrides, MetadataStore};
use super::reconciler::{ForceDirection, PeerReconciler, ReconcileOutcome, ReconcilerProfile};
use super::remote::RemoteStatePoller;
use super::resolve::ConflictResolver;
use super::{ChangeKind, Side, SyncEvent};

/// Buffer flush cadence, matching the unidirectional coalescing window.
const BUFFER_WINDOW: Duration = Duration::from_secs(5);

/// Coordinator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Running(RunState),
    Stopping,
    Stopped,
}

/// Substates while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    BufferingEvents,
    Reconciling,
}

/// Coordinator counters for the statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorStats {
    pub remote: String,
    pub local_events: u64,
    pub remote_events: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub reconciles_completed: u64,
    pub reconciles_failed: u64,
    pub buffered_events: usize,
}

/// Coordinator for one (watched root, two-way remote) pair.
pub struct Coordinator {
    remote: RemoteConfig,
    watch_path: PathBuf,
    store: Arc<MetadataStore>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    reconciler: PeerReconciler,
    rsync: RsyncConfig,
    bidir: BidirConfig,
    buffer: Mutex<HashMap<(String, Side), SyncEvent>>,
    state: Mutex<CoordinatorState>,
    /// Reconcile passes are non-reentrant per pair
    reconcile_gate: tokio::sync::Mutex<()>,
    remote_tx: async_channel::Sender<SyncEvent>,
    remote_rx: async_channel::Receiver<SyncEvent>,
    local_events: AtomicU64,
    remote_events: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    reconciles_completed: AtomicU64,
    reconciles_failed: AtomicU64,
}

impl Coordinator {
    /// Build a coordinator; fails on any metadata path inside the watched
    /// tree.
    pub fn new(
        watch_path: &std::path::Path,
        remote: RemoteConfig,
        rsync: RsyncConfig,
        bidir: BidirConfig,
    ) -> Result<Self, crate::config::ConfigError> {
        let overrides = MetadataOverrides {
            state_dir: remote.metadata_dir.clone(),
            conflict_dir: remote.conflict_backup_dir.clone(),
            lock_file: remote.lock_file.clone(),
        };
        let store = Arc::new(MetadataStore::new(
            watch_path,
            &remote.module,
            &bidir.metadata_base_dir,
            &overrides,
            remote.node_id.clone(),
        )?);

        let detector = ConflictDetector::new(
            Duration::from_secs(bidir.time_tolerance_secs),
            bidir.content_hash,
        );
        let resolver = ConflictResolver::new(
            remote.conflict_strategy,
            store.conflict_dir().to_path_buf(),
            bidir.enable_conflict_backup,
            None,
        );

        let profile = ReconcilerProfile {
            local_root: watch_path.to_path_buf(),
            remote_root: remote.module.clone(),
            host: remote.addr.clone(),
            user: bidir.peer_user.clone(),
            ssh_port: bidir.peer_ssh_port,
            ignore_patterns: Vec::new(),
            strategy: remote.conflict_strategy,
            backup_on_conflict: bidir.enable_conflict_backup,
        };
        let reconciler =
            PeerReconciler::new(profile, Duration::from_secs(bidir.reconcile_timeout_secs));

        let (remote_tx, remote_rx) = async_channel::unbounded();

        Ok(Self {
            remote,
            watch_path: watch_path.to_path_buf(),
            store,
            detector,
            resolver,
            reconciler,
            rsync,
            bidir,
            buffer: Mutex::new(HashMap::new()),
            state: Mutex::new(CoordinatorState::Idle),
            reconcile_gate: tokio::sync::Mutex::new(()),
            remote_tx,
            remote_rx,
            local_events: AtomicU64::new(0),
            remote_events: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
            conflicts_resolved: AtomicU64::new(0),
            reconciles_completed: AtomicU64::new(0),
            reconciles_failed: AtomicU64::new(0),
        })
    }

    pub fn remote_name(&self) -> String {
        self.remote.display_name()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, next: CoordinatorState) {
        *self.state.lock().expect("state mutex poisoned") = next;
    }

    /// Tee one merged local event into the buffer.
    ///
    /// Called from the engine worker loop; must not block.
    pub fn on_local_event(&self, merged: &MergedEvent) {
        let event = &merged.event;
        let rel = validation::relative_to_root(&event.path, &self.watch_path);
        let rel = rel.to_string_lossy().into_owned();

        let metadata = FileMetadata::from_local(&event.path);
        let sync_event = SyncEvent::new(
            ChangeKind::from(&event.kind),
            rel.clone(),
            Side::Local,
            Some(metadata),
        );

        self.buffer
            .lock()
            .expect("buffer mutex poisoned")
            .insert((rel, Side::Local), sync_event);
        self.local_events.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remote_event(&self, event: SyncEvent) {
        let key = (event.rel_path.clone(), Side::Remote);
        self.buffer
            .lock()
            .expect("buffer mutex poisoned")
            .insert(key, event);
        self.remote_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Start the coordinator loops: remote intake, buffer flush, periodic
    /// sweep, state poller, plus one immediate full reconcile.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.set_state(CoordinatorState::Starting);
        tracing::info!(remote = %self.remote_name(), "bidirectional coordinator starting");

        let mut tasks = Vec::new();

        // initial full reconcile, off the startup path
        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            if !coordinator.reconciler.is_available().await {
                tracing::warn!(
                    remote = %coordinator.remote_name(),
                    "reconciler tool not available, skipping initial sync"
                );
                coordinator.set_state(CoordinatorState::Running(RunState::BufferingEvents));
                return;
            }
            coordinator.reconcile(None, None).await;
            if let Err(err) = coordinator.store.refresh_from_disk(None) {
                tracing::warn!(error = %err, "failed to seed metadata from disk");
            }
        }));

        // remote intake
        let coordinator = Arc::clone(self);
        let rx = self.remote_rx.clone();
        let mut intake_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => coordinator.on_remote_event(event),
                        Err(_) => break,
                    },
                    _ = intake_shutdown.changed() => break,
                }
            }
        }));

        // buffer flush
        let coordinator = Arc::clone(self);
        let mut flush_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(BUFFER_WINDOW) => {
                        coordinator.flush().await;
                    }
                    _ = flush_shutdown.changed() => break,
                }
            }
        }));

        // periodic unconditional sweep
        let coordinator = Arc::clone(self);
        let sweep_interval = Duration::from_secs(self.remote.sync_interval_secs.max(1));
        let mut sweep_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {
                        tracing::debug!(
                            remote = %coordinator.remote_name(),
                            "periodic reconcile sweep"
                        );
                        coordinator.reconcile(None, None).await;
                    }
                    _ = sweep_shutdown.changed() => break,
                }
            }
        }));

        // remote state poller feeding the intake channel
        let poller = RemoteStatePoller::new(
            Arc::clone(&self.store),
            self.rsync.clone(),
            self.remote.clone(),
            Duration::from_secs(self.remote.sync_interval_secs.max(1)),
            Duration::from_secs(self.bidir.time_tolerance_secs),
            self.remote_tx.clone(),
        );
        tasks.push(tokio::spawn(poller.run(shutdown)));

        self.set_state(CoordinatorState::Running(RunState::BufferingEvents));
        tracing::info!(remote = %self.remote_name(), "bidirectional coordinator started");
        tasks
    }

    /// Flush the keyed buffer: detect and resolve conflicts, reconcile,
    /// update bookkeeping.
    pub async fn flush(&self) {
        let buffered = {
            let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        tracing::info!(
            remote = %self.remote_name(),
            count = buffered.len(),
            "processing buffered events"
        );

        // group per path: at most one event per side survives buffering,
        // so each (local, remote) pair yields at most one conflict
        let mut by_path: HashMap<String, (Option<SyncEvent>, Option<SyncEvent>)> = HashMap::new();
        for ((rel, side), event) in buffered {
            let entry = by_path.entry(rel).or_default();
            match side {
                Side::Local => entry.0 = Some(event),
                Side::Remote => entry.1 = Some(event),
            }
        }

        let touched: Vec<String> = by_path.keys().cloned().collect();
        for (rel, (local, remote)) in by_path {
            let (Some(local), Some(remote)) = (local, remote) else {
                continue;
            };
            if let Some(conflict) = self.detect_pair(&rel, &local, &remote) {
                self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                let resolution = self.resolver.resolve(&conflict, None);
                if resolution.success {
                    self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                }
                for (side, backup) in &resolution.backups {
                    tracing::info!(
                        path = rel,
                        side = %side,
                        backup = %backup.display(),
                        "conflict version backed up"
                    );
                }
            }
        }

        self.reconcile(None, None).await;
        self.update_bookkeeping(&touched);
        self.store.rotate_backups(self.bidir.max_conflict_backups);
    }

    /// Detect the conflict for one path touched on both sides.
    fn detect_pair(&self, rel: &str, local: &SyncEvent, remote: &SyncEvent) -> Option<Conflict> {
        // concurrent renames cannot be reconciled from metadata alone
        if local.kind == ChangeKind::Move && remote.kind == ChangeKind::Move {
            let conflict = Conflict {
                kind: ConflictKind::MoveConflict,
                local: local.metadata_or_missing(),
                remote: remote.metadata_or_missing(),
                base: None,
                details: "both sides moved the path".to_string(),
                detected_at: chrono::Local::now(),
            };
            return Some(conflict);
        }

        let local_meta = FileMetadata::from_local(&self.watch_path.join(rel));
        let remote_meta = remote.metadata_or_missing();
        let base = self.store.file_state(rel).map(|s| s.to_metadata(rel));

        self.detector.detect(&local_meta, &remote_meta, base.as_ref())
    }

    /// One reconcile pass under the non-reentrancy gate.
    pub async fn reconcile(
        &self,
        path_filter: Option<&str>,
        force: Option<ForceDirection>,
    ) -> ReconcileOutcome {
        let _gate = self.reconcile_gate.lock().await;
        self.set_state(CoordinatorState::Running(RunState::Reconciling));

        // lock file presence signals an active reconcile
        if let Err(err) = std::fs::write(self.store.lock_path(), std::process::id().to_string()) {
            tracing::warn!(error = %err, "failed to write reconcile lock file");
        }

        let outcome = self.reconciler.sync(path_filter, force).await;

        if let Err(err) = std::fs::remove_file(self.store.lock_path()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to remove reconcile lock file");
            }
        }

        if outcome.success {
            self.reconciles_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reconciles_failed.fetch_add(1, Ordering::Relaxed);
        }

        self.set_state(CoordinatorState::Running(RunState::BufferingEvents));
        outcome
    }

    /// On-demand reconcile, optionally narrowed to one path or forced to a
    /// direction.
    pub async fn manual_sync(
        &self,
        path_filter: Option<&str>,
        force: Option<ForceDirection>,
    ) -> ReconcileOutcome {
        tracing::info!(
            remote = %self.remote_name(),
            path_filter = ?path_filter,
            "manual sync triggered"
        );
        self.reconcile(path_filter, force).await
    }

    /// Record post-reconcile state for the paths touched this flush.
    fn update_bookkeeping(&self, touched: &[String]) {
        for rel in touched {
            let abs = self.watch_path.join(rel);
            if abs.exists() {
                let meta = FileMetadata::from_local(&abs);
                if let Err(err) = self.store.update_file(
                    rel,
                    meta.mtime.unwrap_or(0.0),
                    meta.size.unwrap_or(0),
                    meta.content_hash,
                ) {
                    tracing::warn!(path = rel, error = %err, "failed to update file state");
                }
            } else if let Err(err) = self.store.remove_file(rel) {
                tracing::warn!(path = rel, error = %err, "failed to remove file state");
            }
        }
    }

    pub async fn stop(&self) {
        self.set_state(CoordinatorState::Stopping);
        // a final flush drains whatever the window still holds
        self.flush().await;
        self.set_state(CoordinatorState::Stopped);
        tracing::info!(remote = %self.remote_name(), "bidirectional coordinator stopped");
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            remote: self.remote_name(),
            local_events: self.local_events.load(Ordering::Relaxed),
            remote_events: self.remote_events.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            reconciles_completed: self.reconciles_completed.load(Ordering::Relaxed),
            reconciles_failed: self.reconciles_failed.load(Ordering::Relaxed),
            buffered_events: self
                .buffer
                .lock()
                .map(|b| b.len())
                .unwrap_or_default(),
        }
    }
}
