//! Time-windowed event coalescer.
//!
//! Events are buffered per path inside a sliding window (default 5 s). At
//! window close each path group collapses to the single highest-priority
//! event, descendants of a deleted directory are suppressed, and the
//! survivors are published to a bounded FIFO consumed by the worker pool.
//! Producers block when the FIFO is full; nothing is dropped silently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::QueueConfig;
use crate::events::{Event, EventKind, MergedEvent};

/// Queue counters reported in the statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub events_received: u64,
    pub events_merged: u64,
    pub events_published: u64,
    pub events_suppressed: u64,
    pub pending_groups: usize,
    pub fifo_len: usize,
}

struct Pending {
    groups: HashMap<PathBuf, Vec<Event>>,
    last_flush: Instant,
}

/// Coalescing queue between the watcher and the dispatcher workers.
pub struct EventQueue {
    window: Duration,
    pending: Mutex<Pending>,
    /// Serializes flushes so per-path window ordering is preserved
    flush_gate: tokio::sync::Mutex<()>,
    tx: async_channel::Sender<MergedEvent>,
    rx: async_channel::Receiver<MergedEvent>,
    received: AtomicU64,
    merged: AtomicU64,
    published: AtomicU64,
    suppressed: AtomicU64,
}

impl EventQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (tx, rx) = async_channel::bounded(config.capacity.max(1));
        Self {
            window: Duration::from_secs(config.window_secs),
            pending: Mutex::new(Pending {
                groups: HashMap::new(),
                last_flush: Instant::now(),
            }),
            flush_gate: tokio::sync::Mutex::new(()),
            tx,
            rx,
            received: AtomicU64::new(0),
            merged: AtomicU64::new(0),
            published: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Buffer one event; flushes first when the window has already elapsed.
    pub async fn push(&self, event: Event) {
        let window_elapsed = {
            let mut pending = self.pending.lock().expect("queue mutex poisoned");
            pending
                .groups
                .entry(event.path.clone())
                .or_default()
                .push(event);
            self.received.fetch_add(1, Ordering::Relaxed);
            pending.last_flush.elapsed() >= self.window
        };

        if window_elapsed {
            self.flush().await;
        }
    }

    /// Close the current window: merge, suppress, publish.
    pub async fn flush(&self) {
        let _gate = self.flush_gate.lock().await;

        let groups = {
            let mut pending = self.pending.lock().expect("queue mutex poisoned");
            pending.last_flush = Instant::now();
            if pending.groups.is_empty() {
                return;
            }
            std::mem::take(&mut pending.groups)
        };

        let deleted_dirs = delete_dir_roots(&groups);

        let mut survivors = Vec::new();
        for (path, events) in groups {
            let Some(merged) = merge_group(&events) else {
                continue;
            };
            if merged.merged_count > 1 {
                self.merged
                    .fetch_add((merged.merged_count - 1) as u64, Ordering::Relaxed);
            }
            if merged.event.kind != EventKind::DeleteDir
                && has_strict_ancestor(&path, &deleted_dirs)
            {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(path = %path.display(), "event suppressed by ancestor delete");
                continue;
            }
            survivors.push(merged);
        }

        for merged in survivors {
            // send().await is the backpressure point: the flusher blocks
            // rather than dropping when the FIFO is full
            if self.tx.send(merged).await.is_err() {
                return;
            }
            self.published.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Receive the next merged event; errors once the queue is closed and drained.
    pub async fn recv(&self) -> Result<MergedEvent, async_channel::RecvError> {
        self.rx.recv().await
    }

    /// Close the FIFO so workers drain remaining events and exit.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            events_received: self.received.load(Ordering::Relaxed),
            events_merged: self.merged.load(Ordering::Relaxed),
            events_published: self.published.load(Ordering::Relaxed),
            events_suppressed: self.suppressed.load(Ordering::Relaxed),
            pending_groups: self
                .pending
                .lock()
                .map(|p| p.groups.len())
                .unwrap_or_default(),
            fifo_len: self.tx.len(),
        }
    }
}

/// Auto-flush loop: close the window every `window` seconds until shutdown,
/// then drain once.
pub async fn run_auto_flush(
    queue: std::sync::Arc<EventQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let window = queue.window;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(window) => {
                queue.flush().await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    // final drain so buffered events are not lost on stop
    queue.flush().await;
    tracing::debug!("auto flush stopped");
}

/// Collapse one path group to its single highest-priority event.
///
/// Ties keep arrival order: the first event at the maximum priority wins.
pub fn merge_group(events: &[Event]) -> Option<MergedEvent> {
    let mut best: Option<&Event> = None;
    for event in events {
        match best {
            Some(current) if event.kind.priority() <= current.kind.priority() => {}
            _ => best = Some(event),
        }
    }
    best.map(|event| MergedEvent {
        event: event.clone(),
        merged_count: events.len(),
    })
}

/// Paths that saw a `DeleteDir` anywhere in their pending group.
pub fn delete_dir_roots(groups: &HashMap<PathBuf, Vec<Event>>) -> HashSet<PathBuf> {
    groups
        .iter()
        .filter(|(_, events)| events.iter().any(|e| e.kind == EventKind::DeleteDir))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Whether `path` has a strict ancestor among `roots`.
pub fn has_strict_ancestor(path: &Path, roots: &HashSet<PathBuf>) -> bool {
    roots
        .iter()
        .any(|root| path != root && path.starts_with(root))
}
