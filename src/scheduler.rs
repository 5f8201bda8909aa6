//! Scheduled full reconciliation.
//!
//! A single ticker triggers a full-directory dispatch across all remotes at
//! the configured interval. Full syncs may overlap with event-driven
//! dispatches; rsync tolerates concurrent runs against the same module.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::CrontabConfig;
use crate::dispatch::Dispatcher;

/// Ticker loop until shutdown; each tick replicates the whole tree.
pub async fn run_scheduler(
    dispatcher: Arc<Dispatcher>,
    config: CrontabConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.schedule_minutes.max(1) * 60);
    let excludes: Vec<String> = config
        .filter
        .as_ref()
        .filter(|f| f.enabled)
        .map(|f| f.patterns.clone())
        .unwrap_or_default();

    tracing::info!(
        interval_minutes = config.schedule_minutes,
        excludes = excludes.len(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                tracing::info!("starting scheduled full sync");
                let result = dispatcher.sync_full(&excludes).await;
                if result.all_success {
                    tracing::info!("scheduled full sync completed");
                } else {
                    let failures = result.outcomes.iter().filter(|o| !o.success).count();
                    tracing::warn!(failures, "scheduled full sync had failures");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!("scheduler stopped");
}
