//! Run command implementation: the long-lived replication daemon.

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::watch;

use driftsync::config::Config;
use driftsync::engine::Engine;

/// Run the daemon until SIGINT/SIGTERM.
///
/// Exit semantics: configuration or watcher-init errors propagate (the
/// process exits 1); a signal produces a clean stop and exit 0.
pub fn run_daemon(config_path: PathBuf, full_sync_first: bool) -> Result<()> {
    let config = Config::from_file(&config_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Register signal handlers for SIGINT and SIGTERM
    #[cfg(unix)]
    {
        use signal_hook::consts::signal;
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([signal::SIGTERM, signal::SIGINT])?;
        std::thread::spawn(move || {
            for _ in &mut signals {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
        });
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut engine = Engine::new(config)?;

        if full_sync_first {
            let outcome = engine.full_sync().await;
            if !outcome.all_success {
                tracing::warn!("initial full sync had failures");
            }
        }

        engine.start(shutdown_rx.clone()).await?;

        // park until the signal thread flips the channel
        let mut shutdown = shutdown_rx;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        engine.stop().await;
        Ok(())
    })
}
