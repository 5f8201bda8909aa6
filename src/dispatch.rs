//! Transfer dispatcher: builds rsync invocations per remote, runs them with
//! bounded concurrency and timeouts, and interprets exit status.
//!
//! Exit-code policy: 0 is success; for delete operations, exit 23 combined
//! with a "No such file or directory" stderr means the target was already
//! gone and is coerced to success. Everything else is a failure and is
//! appended to the failure ledger for later retry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::{RemoteConfig, RsyncConfig};
use crate::events::{Event, EventKind, MergedEvent};
use crate::faillog::{FailureLedger, LedgerEntry};
use crate::validation;

const MISSING_TARGET_STDERR: &str = "No such file or directory";
const MISSING_TARGET_EXIT: i32 = 23;

/// Result of one transfer invocation against one remote.
#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    pub remote: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Spawn/timeout/cancellation description when no exit code applies
    pub error: Option<String>,
    /// The literal command line, for the failure ledger
    pub command: String,
}

impl RemoteOutcome {
    fn already_applied(remote: String) -> Self {
        Self {
            remote,
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            command: String::new(),
        }
    }
}

/// Aggregate outcome of one merged event across all remotes.
#[derive(Debug)]
pub struct EventOutcome {
    pub path: PathBuf,
    pub event_label: &'static str,
    pub outcomes: Vec<RemoteOutcome>,
    pub all_success: bool,
}

/// Aggregate outcome of a full-directory replication.
#[derive(Debug)]
pub struct FullSyncOutcome {
    pub outcomes: Vec<RemoteOutcome>,
    pub all_success: bool,
}

/// Dispatcher counters reported in the statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub total_invocations: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// One planned invocation step for a single remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPlan {
    /// Spawn the transfer tool with this argv
    Run {
        argv: Vec<String>,
        /// Delete semantics: enables the exit-23 coercion
        is_delete: bool,
    },
    /// The source and its parent are both gone; the delete is already
    /// effective and no process is spawned
    AlreadyApplied,
}

/// Builds and executes transfer invocations for every configured remote.
pub struct Dispatcher {
    rsync: RsyncConfig,
    remotes: Vec<RemoteConfig>,
    watch_path: PathBuf,
    ledger: Option<Arc<FailureLedger>>,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        rsync: RsyncConfig,
        remotes: Vec<RemoteConfig>,
        watch_path: PathBuf,
        ledger: Option<Arc<FailureLedger>>,
    ) -> Self {
        Self {
            rsync,
            remotes,
            watch_path,
            ledger,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Replicate one merged event to all remotes, concurrently.
    pub async fn sync_event(&self, merged: &MergedEvent) -> EventOutcome {
        let event = &merged.event;
        let timeout = self.process_timeout();

        let mut set = JoinSet::new();
        for remote in &self.remotes {
            let plans = self.plans_for_event(event, remote);
            let display = remote.display_name();
            set.spawn(async move { run_plans(display, plans, timeout).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(error = %err, "transfer task panicked"),
            }
        }

        self.record(&outcomes);
        for outcome in outcomes.iter().filter(|o| !o.success) {
            tracing::warn!(
                remote = %outcome.remote,
                exit_code = ?outcome.exit_code,
                path = %event.path.display(),
                "transfer failed"
            );
            if let Some(ledger) = &self.ledger {
                let entry = LedgerEntry {
                    event_label: event.kind.label(),
                    source: event.path.display().to_string(),
                    remote: outcome.remote.clone(),
                    command: outcome.command.clone(),
                };
                if let Err(err) = ledger.append(&entry) {
                    tracing::error!(error = %err, "failed to record ledger entry");
                }
            }
        }

        let all_success = outcomes.iter().all(|o| o.success);
        EventOutcome {
            path: event.path.clone(),
            event_label: event.kind.label(),
            outcomes,
            all_success,
        }
    }

    /// Replicate the whole watched tree to all remotes.
    pub async fn sync_full(&self, excludes: &[String]) -> FullSyncOutcome {
        tracing::info!(root = %self.watch_path.display(), "starting full directory sync");

        let mut set = JoinSet::new();
        for remote in &self.remotes {
            let argv = self.build_full_sync_command(remote, excludes);
            let display = remote.display_name();
            set.spawn(async move {
                let plans = vec![CommandPlan::Run {
                    argv,
                    is_delete: false,
                }];
                run_plans(display, plans, None).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(error = %err, "full sync task panicked"),
            }
        }

        self.record(&outcomes);
        let all_success = outcomes.iter().all(|o| o.success);
        tracing::info!(
            remotes = outcomes.len(),
            all_success,
            "full directory sync completed"
        );
        FullSyncOutcome {
            outcomes,
            all_success,
        }
    }

    /// Invocation steps for one event against one remote.
    ///
    /// Moves replicate as a delete of the old remote path followed by a
    /// transfer of the new one; the watcher guarantees both endpoints are
    /// inside the watched tree (a rename crossing the boundary arrives as a
    /// plain create or delete instead).
    pub fn plans_for_event(&self, event: &Event, remote: &RemoteConfig) -> Vec<CommandPlan> {
        match &event.kind {
            EventKind::Move { dest } => vec![
                self.build_delete_plan(&event.path, remote),
                self.build_copy_plan(dest, remote),
            ],
            kind if kind.is_delete() => vec![self.build_delete_plan(&event.path, remote)],
            _ => vec![self.build_copy_plan(&event.path, remote)],
        }
    }

    /// Plan a content transfer of `source`.
    pub fn build_copy_plan(&self, source: &Path, remote: &RemoteConfig) -> CommandPlan {
        let source_str = source.display().to_string();
        let argv = self.assemble(remote, &source_str, source, false);
        CommandPlan::Run {
            argv,
            is_delete: false,
        }
    }

    /// Plan a delete propagation for `source`.
    ///
    /// When the source is already gone locally the invocation is rewritten
    /// to replicate the parent directory's content with `--delete`; when the
    /// parent is gone too the whole subtree delete will be carried by an
    /// ancestor's event, so the step reports success without spawning.
    pub fn build_delete_plan(&self, source: &Path, remote: &RemoteConfig) -> CommandPlan {
        if source.exists() {
            let source_str = source.display().to_string();
            let argv = self.assemble(remote, &source_str, source, true);
            return CommandPlan::Run {
                argv,
                is_delete: true,
            };
        }

        let Some(parent) = source.parent() else {
            return CommandPlan::AlreadyApplied;
        };
        if !parent.exists() {
            tracing::debug!(
                source = %source.display(),
                "source and parent both gone, delete already applied"
            );
            return CommandPlan::AlreadyApplied;
        }

        // trailing slash: replicate the parent's content, not the parent itself
        let source_str = format!("{}/", parent.display());
        tracing::debug!(
            original = %source.display(),
            rewritten = %source_str,
            "using parent directory for delete sync"
        );
        let argv = self.assemble(remote, &source_str, parent, true);
        CommandPlan::Run {
            argv,
            is_delete: true,
        }
    }

    /// Full-tree invocation: watched root content to the module root.
    pub fn build_full_sync_command(&self, remote: &RemoteConfig, excludes: &[String]) -> Vec<String> {
        let mut argv = vec![self.rsync.tool.clone()];
        argv.extend(self.rsync.common_params.split_whitespace().map(String::from));
        argv.push("--delete".to_string());

        if self.rsync.auth_enabled {
            if let Some(file) = &self.rsync.auth_password_file {
                argv.push(format!("--password-file={}", file.display()));
            }
        }
        for pattern in excludes {
            argv.push(format!("--exclude={}", pattern));
        }
        if self.rsync.custom_port_enabled {
            argv.push(format!("--port={}", self.rsync.custom_port));
        }

        // trailing slash is mandatory for content-only semantics
        let source = format!("{}/", self.watch_path.display());
        let dest = if self.rsync.ssh_enabled {
            argv.push("-e".to_string());
            argv.push("ssh".to_string());
            format!("{}:{}/", remote.addr, remote.module)
        } else {
            format!("{}{}::{}/", self.user_prefix(), remote.addr, remote.module)
        };
        argv.push(source);
        argv.push(dest);
        argv
    }

    /// Common flag assembly shared by event plans.
    fn assemble(
        &self,
        remote: &RemoteConfig,
        source_str: &str,
        rel_base: &Path,
        delete: bool,
    ) -> Vec<String> {
        let mut argv = vec![self.rsync.tool.clone()];
        argv.extend(self.rsync.common_params.split_whitespace().map(String::from));

        if delete {
            argv.push("--delete".to_string());
        }
        if self.rsync.auth_enabled {
            if let Some(file) = &self.rsync.auth_password_file {
                argv.push(format!("--password-file={}", file.display()));
            }
        }
        if self.rsync.timeout_enabled {
            argv.push(format!("--timeout={}", self.rsync.timeout_secs));
        }
        if self.rsync.custom_port_enabled {
            argv.push(format!("--port={}", self.rsync.custom_port));
        }

        let rel = validation::relative_to_root(rel_base, &self.watch_path);
        let rel = rel.to_string_lossy();
        let dest = if self.rsync.ssh_enabled {
            argv.push("-e".to_string());
            argv.push("ssh".to_string());
            format!("{}:{}/{}", remote.addr, remote.module, rel)
        } else {
            format!(
                "{}{}::{}/{}",
                self.user_prefix(),
                remote.addr,
                remote.module,
                rel
            )
        };

        argv.push(source_str.to_string());
        argv.push(dest);
        argv
    }

    fn user_prefix(&self) -> String {
        self.rsync
            .auth_users
            .as_ref()
            .map(|user| format!("{}@", user))
            .unwrap_or_default()
    }

    fn process_timeout(&self) -> Option<Duration> {
        self.rsync
            .timeout_enabled
            .then(|| Duration::from_secs(self.rsync.timeout_secs))
    }

    fn record(&self, outcomes: &[RemoteOutcome]) {
        self.total
            .fetch_add(outcomes.len() as u64, Ordering::Relaxed);
        let ok = outcomes.iter().filter(|o| o.success).count() as u64;
        self.succeeded.fetch_add(ok, Ordering::Relaxed);
        self.failed
            .fetch_add(outcomes.len() as u64 - ok, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            total_invocations: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Run one remote's plan steps in order; the first failing step decides the
/// outcome.
async fn run_plans(
    remote: String,
    plans: Vec<CommandPlan>,
    timeout: Option<Duration>,
) -> RemoteOutcome {
    let mut last: Option<RemoteOutcome> = None;
    for plan in plans {
        match plan {
            CommandPlan::AlreadyApplied => {
                last.get_or_insert_with(|| RemoteOutcome::already_applied(remote.clone()));
            }
            CommandPlan::Run { argv, is_delete } => {
                let command = argv.join(" ");
                tracing::debug!(remote = %remote, command = %command, "executing transfer");
                let exec = run_transfer(&argv, timeout).await;

                let mut success = exec.error.is_none() && exec.exit_code == Some(0);
                if !success
                    && is_delete
                    && exec.exit_code == Some(MISSING_TARGET_EXIT)
                    && exec.stderr.contains(MISSING_TARGET_STDERR)
                {
                    tracing::debug!(
                        remote = %remote,
                        "target already absent on delete, coercing to success"
                    );
                    success = true;
                }

                let outcome = RemoteOutcome {
                    remote: remote.clone(),
                    success,
                    exit_code: exec.exit_code,
                    stdout: exec.stdout,
                    stderr: exec.stderr,
                    error: exec.error,
                    command,
                };
                if !outcome.success {
                    return outcome;
                }
                last = Some(outcome);
            }
        }
    }
    last.unwrap_or_else(|| RemoteOutcome::already_applied(remote))
}

struct ExecResult {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

/// Spawn the transfer tool with captured output, honoring the timeout.
///
/// `kill_on_drop` reaps the child when the timeout drops the wait future,
/// which is the hard-kill path on expiry and on shutdown.
async fn run_transfer(argv: &[String], timeout: Option<Duration>) -> ExecResult {
    let Some((program, args)) = argv.split_first() else {
        return ExecResult {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some("empty command".to_string()),
        };
    };

    let child = tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => {
            return ExecResult {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("spawn failed: {}", err)),
            }
        }
    };

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                return ExecResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("timed out after {}s", limit.as_secs())),
                }
            }
        },
        None => wait.await,
    };

    match output {
        Ok(output) => ExecResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        },
        Err(err) => ExecResult {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("wait failed: {}", err)),
        },
    }
}
