//! Peer reconciler: drives an external two-way synchronizer (unison).
//!
//! The coordinator decides *when* to reconcile; this module owns *how*: it
//! assembles the invocation from the profile, maps the conflict strategy to
//! a prefer direction, runs the process under a timeout and interprets the
//! result. Invocations are batch-mode and non-interactive.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use super::resolve::ResolutionStrategy;

/// Which root wins when a forced direction is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceDirection {
    Local,
    Remote,
}

/// Paired-roots profile for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerProfile {
    pub local_root: PathBuf,
    /// Absolute path of the replica on the peer
    pub remote_root: String,
    pub host: String,
    pub user: Option<String>,
    pub ssh_port: u16,
    pub ignore_patterns: Vec<String>,
    /// Conflict strategy mapped to the prefer direction
    pub strategy: ResolutionStrategy,
    pub backup_on_conflict: bool,
}

impl ReconcilerProfile {
    /// `ssh://[user@]host:port/<remote_root>` root for the peer side.
    ///
    /// An absolute remote root yields the double-slash form the
    /// synchronizer expects; a relative one resolves against the login
    /// home.
    pub fn remote_url(&self) -> String {
        let user = self
            .user
            .as_ref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default();
        format!(
            "ssh://{}{}:{}/{}",
            user, self.host, self.ssh_port, self.remote_root
        )
    }

    /// The `-prefer` argument for this profile's strategy.
    ///
    /// Time-based strategies use the synchronizer's built-in `newer`/`older`
    /// keywords; side-pinning strategies name the winning root. Everything
    /// else defaults to newer.
    pub fn prefer_arg(&self) -> String {
        match self.strategy {
            ResolutionStrategy::KeepNewer => "newer".to_string(),
            ResolutionStrategy::KeepOlder => "older".to_string(),
            ResolutionStrategy::KeepLocal => self.local_root.display().to_string(),
            ResolutionStrategy::KeepRemote => self.remote_url(),
            _ => "newer".to_string(),
        }
    }
}

/// Result of one reconciler run.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ReconcileOutcome {
    fn failure(message: String, duration: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: message,
            duration,
        }
    }
}

/// Two-way synchronizer invocation wrapper.
pub struct PeerReconciler {
    profile: ReconcilerProfile,
    timeout: Duration,
    tool: String,
}

impl PeerReconciler {
    pub fn new(profile: ReconcilerProfile, timeout: Duration) -> Self {
        Self {
            profile,
            timeout,
            tool: "unison".to_string(),
        }
    }

    /// Override the synchronizer binary (tests use a stub).
    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tool = tool.to_string();
        self
    }

    /// Probe whether the synchronizer binary is runnable.
    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Assemble the full argv for one run.
    pub fn build_command(
        &self,
        path_filter: Option<&str>,
        force: Option<ForceDirection>,
    ) -> Vec<String> {
        let profile = &self.profile;
        let mut argv = vec![
            self.tool.clone(),
            profile.local_root.display().to_string(),
            profile.remote_url(),
            "-batch".to_string(),
            "-times".to_string(),
            "-fastcheck".to_string(),
            "true".to_string(),
            "-prefer".to_string(),
            profile.prefer_arg(),
        ];

        if profile.backup_on_conflict {
            argv.push("-copyonconflict".to_string());
        }
        for pattern in &profile.ignore_patterns {
            argv.push("-ignore".to_string());
            argv.push(format!("Path {}", pattern));
        }
        if let Some(filter) = path_filter {
            argv.push("-path".to_string());
            argv.push(filter.to_string());
        }
        if let Some(direction) = force {
            argv.push("-force".to_string());
            argv.push(match direction {
                ForceDirection::Local => profile.local_root.display().to_string(),
                ForceDirection::Remote => profile.remote_url(),
            });
        }

        argv
    }

    /// Run one reconcile pass, killing the process on timeout.
    pub async fn sync(
        &self,
        path_filter: Option<&str>,
        force: Option<ForceDirection>,
    ) -> ReconcileOutcome {
        let argv = self.build_command(path_filter, force);
        let started = Instant::now();
        tracing::info!(command = %argv.join(" "), "starting two-way reconcile");

        let child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return ReconcileOutcome::failure(
                    format!("failed to spawn {}: {}", self.tool, err),
                    started.elapsed(),
                )
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return ReconcileOutcome::failure(
                    format!("reconcile wait failed: {}", err),
                    started.elapsed(),
                )
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "reconcile timed out");
                return ReconcileOutcome::failure(
                    format!("timed out after {}s", self.timeout.as_secs()),
                    started.elapsed(),
                );
            }
        };

        let outcome = ReconcileOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };

        if outcome.success {
            tracing::info!(duration_ms = outcome.duration.as_millis() as u64, "reconcile completed");
        } else {
            tracing::error!(
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr.chars().take(500).collect::<String>(),
                "reconcile failed"
            );
        }
        outcome
    }
}
