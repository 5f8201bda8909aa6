//! Failure ledger: an executable retry script plus its periodic executor.
//!
//! Failed transfer invocations are appended to a plain bash script so they
//! can be replayed automatically or run by hand. The executor ticks on a
//! fixed interval, runs the script, and prunes commands that succeeded on
//! retry; commands that keep failing are carried forward in a regenerated
//! script. The `Retrying:`/`SUCCESS:`/`FAILED:` phrasings couple the writer
//! and the executor's parser, so they are frozen here as shared constants.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::FailLogConfig;

/// Echo prefix announcing a command before it is retried.
pub const RETRYING_PREFIX: &str = "Retrying: ";
/// Echo prefix for a command that succeeded on retry.
pub const SUCCESS_PREFIX: &str = "SUCCESS: ";
/// Echo prefix for a command that failed again.
pub const FAILED_PREFIX: &str = "FAILED: ";
/// Marker line of the result-summary footer.
pub const SUMMARY_MARKER: &str = "=== Retry Summary ===";

const EXIT_CODE_SUFFIX: &str = " (exit code:";

/// Ledger I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One failed invocation to be recorded.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Event kind label (CREATE_FILE, DELETE_DIR, ...)
    pub event_label: &'static str,
    /// Source path as dispatched
    pub source: String,
    /// Remote display name (`addr::module`)
    pub remote: String,
    /// The literal command line to retry
    pub command: String,
}

/// Append-only writer for the retry script.
///
/// Appends are serialized so entry blocks from concurrent workers never
/// interleave. Only the executor truncates or rewrites the file.
pub struct FailureLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FailureLedger {
    pub fn new(config: &FailLogConfig) -> Self {
        Self {
            path: config.path.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one failed invocation, creating the script with its header
    /// and counter preamble on first use.
    pub fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().expect("ledger mutex poisoned");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;
        }

        let is_new = !self.path.exists();
        let mut block = String::new();
        if is_new {
            block.push_str(&script_header());
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        block.push_str(&format!(
            "# Failed at {} - {} {} -> {}\n",
            timestamp, entry.event_label, entry.source, entry.remote
        ));
        block.push_str(&scaffold_entry(&entry.command));

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(block.as_bytes())
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;

        if is_new {
            make_executable(&self.path);
        }

        tracing::info!(
            command = %entry.command,
            remote = %entry.remote,
            script = %self.path.display(),
            "failure recorded to retry script"
        );
        Ok(())
    }
}

/// Periodic executor of the retry script.
///
/// Independent of the dispatcher: it owns truncation and regeneration of
/// the ledger, and survives its own errors (each tick logs and continues).
pub struct LedgerExecutor {
    path: PathBuf,
    interval: Duration,
    /// Command needle that must appear for the script to be worth running
    tool_needle: String,
}

impl LedgerExecutor {
    pub fn new(config: &FailLogConfig, tool: &str) -> Self {
        Self {
            path: config.path.clone(),
            interval: Duration::from_secs(config.time_to_execute_secs.max(1)),
            tool_needle: format!("{} ", tool),
        }
    }

    /// Tick loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            script = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "ledger executor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "ledger executor tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("ledger executor stopped");
    }

    /// One executor tick: run the script and prune retried commands.
    pub async fn tick(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if !has_transfer_commands(&content, &self.tool_needle) {
            tracing::debug!(script = %self.path.display(), "retry script empty, skipping");
            return Ok(());
        }

        if !content.contains(SUMMARY_MARKER) {
            let mut appended = content.clone();
            appended.push_str(&summary_footer());
            std::fs::write(&self.path, &appended)?;
        }
        make_executable(&self.path);

        let output = tokio::process::Command::new("/bin/bash")
            .arg(&self.path)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.success() {
            tracing::info!(script = %self.path.display(), "all retries succeeded, clearing script");
            std::fs::write(&self.path, script_header())?;
            return Ok(());
        }

        let still_failing = parse_failed_commands(&stdout);
        if still_failing.is_empty() {
            // Could not attribute the failure to specific commands; keep the
            // script as-is rather than losing entries
            tracing::warn!(
                script = %self.path.display(),
                "retry script failed but no FAILED lines parsed, preserving"
            );
            return Ok(());
        }

        tracing::info!(
            still_failing = still_failing.len(),
            "regenerating retry script with remaining failures"
        );
        std::fs::write(&self.path, regenerate_script(&still_failing))?;
        make_executable(&self.path);
        Ok(())
    }
}

/// Interpreter line and counter preamble.
pub fn script_header() -> String {
    "#!/bin/bash\n# Retry script generated by driftsync\nRETRY_COUNT=0\nFAILED_COUNT=0\n\n"
        .to_string()
}

/// Scaffold wrapping one command: announce, run, capture, branch, count.
pub fn scaffold_entry(command: &str) -> String {
    format!(
        "echo '{retry}{cmd}'\n\
         {cmd}\n\
         RETRY_RESULT=$?\n\
         if [ $RETRY_RESULT -eq 0 ]; then\n\
         \x20   echo '{ok}{cmd}'\n\
         else\n\
         \x20   echo '{fail}{cmd} (exit code: '$RETRY_RESULT')'\n\
         \x20   FAILED_COUNT=$((FAILED_COUNT + 1))\n\
         fi\n\
         RETRY_COUNT=$((RETRY_COUNT + 1))\n\n",
        retry = RETRYING_PREFIX,
        ok = SUCCESS_PREFIX,
        fail = FAILED_PREFIX,
        cmd = command,
    )
}

/// Result-summary footer: totals, then exit 0/1 by failure count.
pub fn summary_footer() -> String {
    format!(
        "echo '{marker}'\n\
         echo \"Retried: $RETRY_COUNT\"\n\
         echo \"Failed: $FAILED_COUNT\"\n\
         if [ $FAILED_COUNT -eq 0 ]; then\n\
         \x20   exit 0\n\
         else\n\
         \x20   exit 1\n\
         fi\n",
        marker = SUMMARY_MARKER,
    )
}

/// Whether the script contains any actual transfer command lines.
pub fn has_transfer_commands(content: &str, tool_needle: &str) -> bool {
    content
        .lines()
        .any(|line| line.trim_start().starts_with(tool_needle))
}

/// Line-oriented scan of the script output for commands that failed again.
///
/// Tolerant of unknown lines: only `Retrying:`-announced commands are
/// considered, `FAILED:` keeps them, `SUCCESS:` drops them. Returns the
/// still-failing commands in first-failure order.
pub fn parse_failed_commands(output: &str) -> Vec<String> {
    let mut announced: HashSet<String> = HashSet::new();
    let mut failed: Vec<String> = Vec::new();
    let mut succeeded: HashSet<String> = HashSet::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(cmd) = line.strip_prefix(RETRYING_PREFIX) {
            announced.insert(cmd.to_string());
        } else if let Some(rest) = line.strip_prefix(FAILED_PREFIX) {
            let cmd = rest
                .rfind(EXIT_CODE_SUFFIX)
                .map(|idx| &rest[..idx])
                .unwrap_or(rest)
                .trim_end();
            if announced.contains(cmd) && !failed.iter().any(|c| c == cmd) {
                failed.push(cmd.to_string());
            }
        } else if let Some(cmd) = line.strip_prefix(SUCCESS_PREFIX) {
            succeeded.insert(cmd.trim_end().to_string());
        }
    }

    failed.retain(|cmd| !succeeded.contains(cmd));
    failed
}

/// Fresh script carrying only the still-failing commands.
pub fn regenerate_script(commands: &[String]) -> String {
    let mut script = script_header();
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    for command in commands {
        script.push_str(&format!("# Still failing at {}\n", timestamp));
        script.push_str(&scaffold_entry(command));
    }
    script
}

fn make_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)) {
            tracing::warn!(path = %path.display(), error = %err, "failed to chmod retry script");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_failed_drops_succeeded() {
        let output = "\
Retrying: rsync -artuz /w/a.txt h::m/a.txt
SUCCESS: rsync -artuz /w/a.txt h::m/a.txt
Retrying: rsync -artuz /w/b.txt h::m/b.txt
FAILED: rsync -artuz /w/b.txt h::m/b.txt (exit code: 23)
";
        let failed = parse_failed_commands(output);
        assert_eq!(failed, vec!["rsync -artuz /w/b.txt h::m/b.txt"]);
    }

    #[test]
    fn test_parse_ignores_unknown_lines() {
        let output = "\
random noise
Retrying: rsync -a /x h::m/x
garbage in between
FAILED: rsync -a /x h::m/x (exit code: 12)
=== Retry Summary ===
";
        assert_eq!(parse_failed_commands(output), vec!["rsync -a /x h::m/x"]);
    }

    #[test]
    fn test_parse_requires_announcement() {
        // FAILED line for a command never announced is not trusted
        let output = "FAILED: rsync -a /x h::m/x (exit code: 1)\n";
        assert!(parse_failed_commands(output).is_empty());
    }

    #[test]
    fn test_transfer_command_detection() {
        assert!(has_transfer_commands("rsync -a /x h::m/x\n", "rsync "));
        assert!(!has_transfer_commands(script_header().as_str(), "rsync "));
        assert!(!has_transfer_commands("# rsync in a comment\n", "rsync "));
    }

    #[test]
    fn test_scaffold_round_trips_through_parser() {
        let cmd = "rsync -artuz /w/c.txt h::m/c.txt";
        let scaffold = scaffold_entry(cmd);
        // simulate the echoes the scaffold would produce on failure
        let simulated = format!("{}{}\n{}{} (exit code: 10)\n", RETRYING_PREFIX, cmd, FAILED_PREFIX, cmd);
        assert!(scaffold.contains(cmd));
        assert_eq!(parse_failed_commands(&simulated), vec![cmd.to_string()]);
    }
}
