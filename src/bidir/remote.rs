//! Remote change ingress: a polling differ over the peer's state file.
//!
//! The peer publishes the same `sync_state.json` document this node keeps;
//! each poll fetches it with the transfer tool, diffs it against the
//! previous snapshot, and synthesizes remote-side [`SyncEvent`]s for the
//! coordinator. A fetch failure degrades to an empty diff: remote changes
//! are then only picked up by the next periodic reconcile sweep.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{RemoteConfig, RsyncConfig};

use super::metadata::{MetadataStore, SyncState};
use super::{ChangeKind, Side, SyncEvent};

/// Polls the peer's published sync state and emits remote change events.
pub struct RemoteStatePoller {
    store: Arc<MetadataStore>,
    rsync: RsyncConfig,
    remote: RemoteConfig,
    interval: Duration,
    /// mtime drift below this is not a change
    tolerance_secs: f64,
    tx: async_channel::Sender<SyncEvent>,
}

impl RemoteStatePoller {
    pub fn new(
        store: Arc<MetadataStore>,
        rsync: RsyncConfig,
        remote: RemoteConfig,
        interval: Duration,
        tolerance: Duration,
        tx: async_channel::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            rsync,
            remote,
            interval,
            tolerance_secs: tolerance.as_secs_f64(),
            tx,
        }
    }

    /// Poll loop until shutdown. The first successful fetch only seeds the
    /// baseline; events flow from the second fetch on.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            remote = %self.remote.display_name(),
            interval_secs = self.interval.as_secs(),
            "remote state poller started"
        );

        let mut baseline: Option<SyncState> = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let Some(fetched) = self.fetch_peer_state().await else {
                        continue;
                    };
                    if let Some(previous) = baseline.take() {
                        for event in diff_states(&previous, &fetched, self.tolerance_secs) {
                            if self.tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    baseline = Some(fetched);
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("remote state poller stopped");
    }

    /// Fetch the peer's `sync_state.json` into a temp file and parse it.
    ///
    /// The peer is assumed to mirror this node's metadata layout: in daemon
    /// mode the state is exposed as a `<module>_metadata` module, over SSH
    /// it sits at the same slugged path.
    pub async fn fetch_peer_state(&self) -> Option<SyncState> {
        let temp = match tempfile::NamedTempFile::new() {
            Ok(temp) => temp,
            Err(err) => {
                tracing::error!(error = %err, "cannot create temp file for remote state");
                return None;
            }
        };
        let local_path = temp.path().to_path_buf();

        let argv = self.build_fetch_command(&local_path);
        tracing::debug!(command = %argv.join(" "), "fetching remote state");

        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                match std::fs::read_to_string(&local_path)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| {
                        serde_json::from_str::<SyncState>(&raw).map_err(|e| e.to_string())
                    }) {
                    Ok(state) => Some(state),
                    Err(err) => {
                        tracing::warn!(error = %err, "remote state unparsable");
                        None
                    }
                }
            }
            Ok(output) => {
                tracing::debug!(
                    exit_code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "remote state not available"
                );
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote state fetch failed");
                None
            }
        }
    }

    fn build_fetch_command(&self, local_path: &Path) -> Vec<String> {
        let mut argv = vec![self.rsync.tool.clone()];

        if self.rsync.auth_enabled {
            if let Some(file) = &self.rsync.auth_password_file {
                argv.push(format!("--password-file={}", file.display()));
            }
        }

        let source = if self.rsync.ssh_enabled {
            argv.push("-e".to_string());
            argv.push("ssh".to_string());
            format!(
                "{}:{}",
                self.remote.addr,
                self.store.state_file().display()
            )
        } else {
            let user = self
                .rsync
                .auth_users
                .as_ref()
                .map(|u| format!("{}@", u))
                .unwrap_or_default();
            format!(
                "{}{}::{}_metadata/sync_state.json",
                user, self.remote.addr, self.remote.module
            )
        };

        argv.push(source);
        argv.push(local_path.display().to_string());
        argv
    }
}

/// Diff two successive peer snapshots into remote change events.
pub fn diff_states(previous: &SyncState, current: &SyncState, tolerance_secs: f64) -> Vec<SyncEvent> {
    let mut events = Vec::new();

    for (rel_path, info) in &current.files {
        match previous.files.get(rel_path) {
            None => {
                events.push(SyncEvent::new(
                    ChangeKind::Create,
                    rel_path.clone(),
                    Side::Remote,
                    Some(info.to_metadata(rel_path)),
                ));
            }
            Some(old) => {
                let mtime_changed = (info.mtime - old.mtime).abs() > tolerance_secs;
                let size_changed = info.size != old.size;
                let checksum_changed = match (&info.checksum, &old.checksum) {
                    (Some(new), Some(old)) => new != old,
                    _ => false,
                };
                if mtime_changed || size_changed || checksum_changed {
                    events.push(SyncEvent::new(
                        ChangeKind::Modify,
                        rel_path.clone(),
                        Side::Remote,
                        Some(info.to_metadata(rel_path)),
                    ));
                }
            }
        }
    }

    for rel_path in previous.files.keys() {
        if !current.files.contains_key(rel_path) {
            events.push(SyncEvent::new(
                ChangeKind::Delete,
                rel_path.clone(),
                Side::Remote,
                None,
            ));
        }
    }

    events
}
