//! Composition root: wires watcher, filter, coalescer, worker pool,
//! scheduler, ledger executor and bidirectional coordinators together.
//!
//! Start order: queue auto-flush, watcher, workers, scheduler, coordinator
//! loops, ledger executor, status broadcaster. Stop reverses it with
//! bounded waits. No component holds a back reference to the engine;
//! everything a component needs is passed down as data or a handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bidir::coordinator::{Coordinator, CoordinatorStats};
use crate::config::{Config, ConfigError, SyncMode};
use crate::dispatch::{Dispatcher, DispatcherStats, FullSyncOutcome};
use crate::events::Event;
use crate::faillog::{FailureLedger, LedgerExecutor};
use crate::filter::{EventFilter, FilterStats};
use crate::queue::{run_auto_flush, EventQueue, QueueStats};
use crate::scheduler::run_scheduler;
use crate::watcher::FsWatcher;

/// How often the status broadcaster pushes a snapshot.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);
/// Bounded wait per task on shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle invoked with every status snapshot; the dashboard collaborator
/// registers one before start.
pub type BroadcastHandle = Arc<dyn Fn(&StatsSnapshot) + Send + Sync>;

#[derive(Default)]
struct Counters {
    events_processed: AtomicU64,
    files_synced: AtomicU64,
    files_filtered: AtomicU64,
    sync_success: AtomicU64,
    sync_failed: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub events_processed: u64,
    pub files_synced: u64,
    pub files_filtered: u64,
    pub sync_success: u64,
    pub sync_failed: u64,
    pub watcher_running: bool,
    pub queue: QueueStats,
    pub dispatcher: DispatcherStats,
    pub filter: FilterStats,
    pub coordinators: Vec<CoordinatorStats>,
}

/// Shared snapshot builder handed to the broadcaster task.
#[derive(Clone)]
struct StatsCollector {
    started_at: Instant,
    counters: Arc<Counters>,
    queue: Arc<EventQueue>,
    dispatcher: Arc<Dispatcher>,
    filter: Arc<EventFilter>,
    coordinators: Vec<Arc<Coordinator>>,
    watcher_running: Arc<AtomicBool>,
}

impl StatsCollector {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            files_synced: self.counters.files_synced.load(Ordering::Relaxed),
            files_filtered: self.counters.files_filtered.load(Ordering::Relaxed),
            sync_success: self.counters.sync_success.load(Ordering::Relaxed),
            sync_failed: self.counters.sync_failed.load(Ordering::Relaxed),
            watcher_running: self.watcher_running.load(Ordering::SeqCst),
            queue: self.queue.stats(),
            dispatcher: self.dispatcher.stats(),
            filter: self.filter.stats(),
            coordinators: self.coordinators.iter().map(|c| c.stats()).collect(),
        }
    }
}

/// The replication engine.
pub struct Engine {
    config: Config,
    filter: Arc<EventFilter>,
    queue: Arc<EventQueue>,
    dispatcher: Arc<Dispatcher>,
    coordinators: Vec<Arc<Coordinator>>,
    counters: Arc<Counters>,
    watcher: Option<FsWatcher>,
    watcher_running: Arc<AtomicBool>,
    broadcast: Option<BroadcastHandle>,
    tasks: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl Engine {
    /// Build the engine from a validated configuration.
    ///
    /// Any configuration refusal (missing watch path, metadata inside the
    /// watched tree, malformed remote) surfaces here, before anything runs.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let filter = Arc::new(EventFilter::new(&config.filter));
        let queue = Arc::new(EventQueue::new(&config.queue));
        let ledger = Arc::new(FailureLedger::new(&config.fail_log));
        let dispatcher = Arc::new(Dispatcher::new(
            config.rsync.clone(),
            config.remotes.clone(),
            config.watch_path.clone(),
            Some(Arc::clone(&ledger)),
        ));

        let mut coordinators = Vec::new();
        if config.bidirectional.enabled {
            for remote in &config.remotes {
                if matches!(remote.mode, SyncMode::TwoWay) {
                    let coordinator = Coordinator::new(
                        &config.watch_path,
                        remote.clone(),
                        config.rsync.clone(),
                        config.bidirectional.clone(),
                    )?;
                    coordinators.push(Arc::new(coordinator));
                }
            }
        }

        tracing::info!(
            watch_path = %config.watch_path.display(),
            remotes = config.remotes.len(),
            workers = config.worker_count,
            bidirectional = coordinators.len(),
            "engine initialized"
        );

        Ok(Self {
            config,
            filter,
            queue,
            dispatcher,
            coordinators,
            counters: Arc::new(Counters::default()),
            watcher: None,
            watcher_running: Arc::new(AtomicBool::new(false)),
            broadcast: None,
            tasks: Vec::new(),
            started_at: Instant::now(),
        })
    }

    /// Register the dashboard broadcast handle. Set once, before start.
    pub fn set_broadcast(&mut self, handle: BroadcastHandle) {
        self.broadcast = Some(handle);
    }

    /// Start all loops. Fatal only when the watcher cannot initialize.
    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.started_at = Instant::now();
        tracing::info!("starting engine");

        // coalescer auto-flush
        self.tasks.push(tokio::spawn(run_auto_flush(
            Arc::clone(&self.queue),
            shutdown.clone(),
        )));

        // watcher -> ingest channel; the notify callback only does a
        // non-blocking send, the ingest loop below does filter + push
        let (raw_tx, raw_rx) = async_channel::unbounded::<Event>();
        let watcher = FsWatcher::spawn(
            &self.config.watch_path,
            self.config.event_mask.clone(),
            raw_tx,
            Duration::from_secs(self.config.queue.window_secs),
        )?;
        self.watcher_running = watcher.running_flag();
        self.watcher = Some(watcher);

        let filter = Arc::clone(&self.filter);
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        self.tasks.push(tokio::spawn(async move {
            while let Ok(event) = raw_rx.recv().await {
                if filter.should_ignore(&event.path) {
                    counters.files_filtered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                queue.push(event).await;
            }
            tracing::debug!("ingest loop stopped");
        }));

        // worker pool
        for worker_id in 0..self.config.worker_count.max(1) {
            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let counters = Arc::clone(&self.counters);
            let coordinators = self.coordinators.clone();
            self.tasks.push(tokio::spawn(async move {
                run_worker(worker_id, queue, dispatcher, coordinators, counters).await;
            }));
        }

        // scheduled full reconciliation
        if self.config.crontab.enabled {
            self.tasks.push(tokio::spawn(run_scheduler(
                Arc::clone(&self.dispatcher),
                self.config.crontab.clone(),
                shutdown.clone(),
            )));
        }

        // bidirectional coordinators
        for coordinator in &self.coordinators {
            let mut spawned = coordinator.start(shutdown.clone()).await;
            self.tasks.append(&mut spawned);
        }

        // failure-ledger executor
        let executor = LedgerExecutor::new(&self.config.fail_log, &self.config.rsync.tool);
        self.tasks.push(tokio::spawn(executor.run(shutdown.clone())));

        // status broadcaster
        if let Some(handle) = self.broadcast.clone() {
            let collector = self.collector();
            let mut broadcast_shutdown = shutdown;
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(BROADCAST_INTERVAL) => {
                            handle(&collector.snapshot());
                        }
                        _ = broadcast_shutdown.changed() => break,
                    }
                }
            }));
        }

        tracing::info!(
            workers = self.config.worker_count,
            crontab = self.config.crontab.enabled,
            coordinators = self.coordinators.len(),
            "engine started"
        );
        Ok(())
    }

    /// Stop everything in reverse start order with bounded waits.
    pub async fn stop(&mut self) {
        tracing::info!("stopping engine");

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }

        // drain the last window, then let workers run dry
        self.queue.flush().await;
        self.queue.close();

        for coordinator in &self.coordinators {
            coordinator.stop().await;
        }

        for task in self.tasks.drain(..) {
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                tracing::warn!("task did not stop within timeout, detaching");
            }
        }

        let snapshot = self.stats_snapshot();
        tracing::info!(
            events_processed = snapshot.events_processed,
            files_synced = snapshot.files_synced,
            sync_failed = snapshot.sync_failed,
            "engine stopped"
        );
    }

    /// On-demand full replication across all remotes. Idempotent.
    pub async fn full_sync(&self) -> FullSyncOutcome {
        self.dispatcher.sync_full(&[]).await
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.collector().snapshot()
    }

    fn collector(&self) -> StatsCollector {
        StatsCollector {
            started_at: self.started_at,
            counters: Arc::clone(&self.counters),
            queue: Arc::clone(&self.queue),
            dispatcher: Arc::clone(&self.dispatcher),
            filter: Arc::clone(&self.filter),
            coordinators: self.coordinators.clone(),
            watcher_running: Arc::clone(&self.watcher_running),
        }
    }
}

/// One worker: consume merged events, tee to coordinators, dispatch, count.
///
/// A failing iteration is recorded in the outcome values; the loop itself
/// only exits when the queue closes.
async fn run_worker(
    worker_id: usize,
    queue: Arc<EventQueue>,
    dispatcher: Arc<Dispatcher>,
    coordinators: Vec<Arc<Coordinator>>,
    counters: Arc<Counters>,
) {
    tracing::debug!(worker_id, "worker started");

    while let Ok(merged) = queue.recv().await {
        tracing::info!(
            kind = merged.event.kind.label(),
            path = %merged.event.path.display(),
            merged_count = merged.merged_count,
            "processing event"
        );

        for coordinator in &coordinators {
            coordinator.on_local_event(&merged);
        }

        let outcome = dispatcher.sync_event(&merged).await;
        counters.events_processed.fetch_add(1, Ordering::Relaxed);

        let succeeded = outcome.outcomes.iter().filter(|o| o.success).count() as u64;
        let failed = outcome.outcomes.len() as u64 - succeeded;
        counters.sync_success.fetch_add(succeeded, Ordering::Relaxed);
        counters.sync_failed.fetch_add(failed, Ordering::Relaxed);

        if outcome.all_success {
            counters.files_synced.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(
                path = %outcome.path.display(),
                failures = failed,
                "event sync had failures"
            );
        }
    }

    tracing::debug!(worker_id, "worker stopped");
}
