//! Filesystem watcher: adapter over the OS notify facility.
//!
//! Subscribes to a recursive watch of the watched root (newly created
//! subdirectories are picked up by the backend) and translates raw
//! notifications into the uniform [`Event`] model. The notify callback runs
//! on the OS-notify thread and must not block: translated events are handed
//! off with a non-blocking send into the engine's ingest channel.
//!
//! Rename handling: the backend delivers rename-from and rename-to halves
//! with a correlation cookie. Halves pair within one window into a single
//! `Move`; a rename-to with no buffered partner is a create (the source was
//! outside the watched tree), and a rename-from left unpaired past the
//! window becomes a delete (the destination left the tree).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::config::EventMask;
use crate::events::{Event, EventKind};

/// Translates raw notify events into the uniform event model.
///
/// Owns the rename pairing buffer. Lives inside the notify callback; the
/// whole translation is allocation-light and never blocks.
pub struct EventTranslator {
    mask: EventMask,
    pair_window: Duration,
    pending_moves: HashMap<usize, (PathBuf, Instant)>,
}

impl EventTranslator {
    pub fn new(mask: EventMask, pair_window: Duration) -> Self {
        Self {
            mask,
            pair_window,
            pending_moves: HashMap::new(),
        }
    }

    /// Translate one raw notification into zero or more events.
    ///
    /// Expired unpaired rename-from entries are emitted first, as deletes.
    pub fn translate(
        &mut self,
        kind: NotifyKind,
        paths: Vec<PathBuf>,
        tracker: Option<usize>,
    ) -> Vec<Event> {
        let mut out = self.expire_pending_moves();

        let Some(path) = paths.first().cloned() else {
            return out;
        };

        match kind {
            NotifyKind::Create(CreateKind::Folder) => {
                if self.mask.create_folder {
                    out.push(Event::new(EventKind::CreateDir, path));
                }
            }
            NotifyKind::Create(_) => {
                if self.mask.create_file {
                    out.push(Event::new(EventKind::CreateFile, path));
                }
            }
            NotifyKind::Access(AccessKind::Close(AccessMode::Write)) => {
                if self.mask.close_write {
                    out.push(Event::new(EventKind::CloseWrite, path));
                }
            }
            NotifyKind::Modify(ModifyKind::Metadata(_)) => {
                if self.mask.attrib {
                    out.push(Event::new(EventKind::Attrib, path));
                }
            }
            NotifyKind::Modify(ModifyKind::Name(mode)) => {
                self.translate_rename(mode, paths, tracker, &mut out);
            }
            NotifyKind::Modify(_) => {
                if let Some(kind) = self.write_tier_kind() {
                    out.push(Event::new(kind, path));
                }
            }
            NotifyKind::Remove(RemoveKind::Folder) => {
                if self.mask.delete {
                    out.push(Event::new(EventKind::DeleteDir, path));
                }
            }
            NotifyKind::Remove(_) => {
                if self.mask.delete {
                    out.push(Event::new(EventKind::DeleteFile, path));
                }
            }
            _ => {}
        }

        out
    }

    fn translate_rename(
        &mut self,
        mode: RenameMode,
        paths: Vec<PathBuf>,
        tracker: Option<usize>,
        out: &mut Vec<Event>,
    ) {
        match mode {
            RenameMode::From => {
                if !self.mask.moved_from {
                    return;
                }
                let Some(src) = paths.into_iter().next() else {
                    return;
                };
                match tracker {
                    Some(cookie) => {
                        self.pending_moves.insert(cookie, (src, Instant::now()));
                    }
                    // No cookie to pair on: the path is gone from our tree
                    None => out.push(Event::new(EventKind::DeleteFile, src)),
                }
            }
            RenameMode::To => {
                if !self.mask.moved_to {
                    return;
                }
                let Some(dest) = paths.into_iter().next() else {
                    return;
                };
                let paired = tracker.and_then(|cookie| self.pending_moves.remove(&cookie));
                match paired {
                    Some((src, _)) => {
                        out.push(Event::new(EventKind::Move { dest }, src));
                    }
                    // Moved in from outside the watched tree: a creation
                    None => out.push(Event::new(created_kind(&dest), dest)),
                }
            }
            RenameMode::Both => {
                if !(self.mask.moved_from && self.mask.moved_to) {
                    return;
                }
                let mut iter = paths.into_iter();
                if let (Some(src), Some(dest)) = (iter.next(), iter.next()) {
                    out.push(Event::new(EventKind::Move { dest }, src));
                }
            }
            _ => {}
        }
    }

    /// Write-completion tier for backends without a close-write notion.
    fn write_tier_kind(&self) -> Option<EventKind> {
        if self.mask.modify {
            Some(EventKind::Modify)
        } else if self.mask.close_write && !cfg!(target_os = "linux") {
            // inotify reports close-write separately; other backends only
            // have data modifies, which land in the same priority tier
            Some(EventKind::Modify)
        } else {
            None
        }
    }

    /// Unpaired rename-from entries older than the pairing window: the
    /// destination left the watched tree, so the source is a delete.
    fn expire_pending_moves(&mut self) -> Vec<Event> {
        if self.pending_moves.is_empty() {
            return Vec::new();
        }
        let window = self.pair_window;
        let expired: Vec<usize> = self
            .pending_moves
            .iter()
            .filter(|(_, (_, seen))| seen.elapsed() >= window)
            .map(|(cookie, _)| *cookie)
            .collect();
        expired
            .into_iter()
            .filter_map(|cookie| self.pending_moves.remove(&cookie))
            .map(|(src, _)| Event::new(EventKind::DeleteFile, src))
            .collect()
    }

    /// Number of rename-from halves still waiting for their partner.
    pub fn pending_move_count(&self) -> usize {
        self.pending_moves.len()
    }
}

fn created_kind(path: &Path) -> EventKind {
    if path.is_dir() {
        EventKind::CreateDir
    } else {
        EventKind::CreateFile
    }
}

/// Recursive watcher over the watched root.
///
/// Initialization errors (permissions, descriptor exhaustion) are fatal;
/// runtime watch errors are logged and the engine keeps running.
pub struct FsWatcher {
    inner: Option<RecommendedWatcher>,
    running: Arc<AtomicBool>,
}

impl FsWatcher {
    /// Start watching `root`, sending translated events into `tx`.
    pub fn spawn(
        root: &Path,
        mask: EventMask,
        tx: async_channel::Sender<Event>,
        pair_window: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut translator = EventTranslator::new(mask, pair_window);

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(raw) => {
                        let tracker = raw.attrs.tracker();
                        for event in translator.translate(raw.kind, raw.paths, tracker) {
                            // try_send keeps the OS-notify thread non-blocking;
                            // the channel is unbounded so this only fails when
                            // the engine side has shut down
                            if let Err(err) = tx.try_send(event) {
                                tracing::debug!(error = %err, "dropping event after shutdown");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher runtime error");
                    }
                }
            })
            .context("failed to create filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        tracing::info!(root = %root.display(), "filesystem watcher started");

        Ok(Self {
            inner: Some(watcher),
            running,
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Shared liveness flag for the statistics snapshot.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Drop the underlying watcher; no further events are delivered.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.inner.take();
        tracing::info!("filesystem watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;

    fn translator() -> EventTranslator {
        let mask = EventMask {
            create_file: true,
            modify: true,
            attrib: true,
            ..EventMask::default()
        };
        EventTranslator::new(mask, Duration::from_secs(5))
    }

    #[test]
    fn test_paired_rename_becomes_single_move() {
        let mut t = translator();
        let none = t.translate(
            NotifyKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec![PathBuf::from("/w/old")],
            Some(7),
        );
        assert!(none.is_empty());
        assert_eq!(t.pending_move_count(), 1);

        let events = t.translate(
            NotifyKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec![PathBuf::from("/w/new")],
            Some(7),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, PathBuf::from("/w/old"));
        assert_eq!(
            events[0].kind,
            EventKind::Move {
                dest: PathBuf::from("/w/new")
            }
        );
        assert_eq!(t.pending_move_count(), 0);
    }

    #[test]
    fn test_unpaired_rename_to_becomes_create() {
        let mut t = translator();
        let events = t.translate(
            NotifyKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec![PathBuf::from("/w/incoming")],
            Some(9),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::CreateFile);
    }

    #[test]
    fn test_unpaired_rename_from_expires_to_delete() {
        let mask = EventMask::default();
        let mut t = EventTranslator::new(mask, Duration::from_millis(0));
        t.translate(
            NotifyKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec![PathBuf::from("/w/gone")],
            Some(3),
        );
        // any later notification first sweeps the expired half
        let events = t.translate(
            NotifyKind::Modify(ModifyKind::Data(DataChange::Any)),
            vec![PathBuf::from("/w/other")],
            None,
        );
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::DeleteFile && e.path == PathBuf::from("/w/gone")));
    }

    #[test]
    fn test_mask_gates_event_kinds() {
        let mask = EventMask {
            delete: false,
            ..EventMask::default()
        };
        let mut t = EventTranslator::new(mask, Duration::from_secs(5));
        let events = t.translate(
            NotifyKind::Remove(RemoveKind::File),
            vec![PathBuf::from("/w/x")],
            None,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_remove_kinds_map_to_delete_variants() {
        let mut t = translator();
        let dir = t.translate(
            NotifyKind::Remove(RemoveKind::Folder),
            vec![PathBuf::from("/w/d")],
            None,
        );
        assert_eq!(dir[0].kind, EventKind::DeleteDir);
        let file = t.translate(
            NotifyKind::Remove(RemoveKind::File),
            vec![PathBuf::from("/w/f")],
            None,
        );
        assert_eq!(file[0].kind, EventKind::DeleteFile);
    }
}
