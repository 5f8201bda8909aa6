//! Sync command implementation: one-shot full replication.

use std::path::PathBuf;

use anyhow::Result;

use driftsync::config::Config;
use driftsync::dispatch::Dispatcher;
use driftsync::faillog::FailureLedger;

/// Replicate the whole watched tree once and report per-remote results.
pub fn run_sync(config_path: PathBuf, excludes: Vec<String>) -> Result<()> {
    let config = Config::from_file(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let ledger = std::sync::Arc::new(FailureLedger::new(&config.fail_log));
        let dispatcher = Dispatcher::new(
            config.rsync.clone(),
            config.remotes.clone(),
            config.watch_path.clone(),
            Some(ledger),
        );

        let outcome = dispatcher.sync_full(&excludes).await;
        for remote in &outcome.outcomes {
            if remote.success {
                println!("{}: ok", remote.remote);
            } else {
                let reason = remote
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit code {:?}", remote.exit_code));
                println!("{}: FAILED ({})", remote.remote, reason);
            }
        }

        if outcome.all_success {
            Ok(())
        } else {
            Err(anyhow::anyhow!("full sync failed for at least one remote"))
        }
    })
}
