//! End-to-end engine tests: real filesystem events through the watcher,
//! coalescer and worker pool, against a stub transfer tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use driftsync::config::Config;
use driftsync::engine::Engine;
use tempfile::TempDir;
use tokio::sync::watch;

/// Helper: write bytes with full synchronization so the close-write event
/// fires with stable content.
fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    std::io::Write::write_all(&mut file, bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Helper: stub transfer tool that records its argv and succeeds.
fn write_logging_stub(dir: &Path, log: &Path) -> PathBuf {
    let stub = dir.join("rsync-stub");
    fs::write(&stub, format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", log.display())).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&stub, fs::Permissions::from_mode(0o755)).unwrap();
    }
    stub
}

fn engine_config(watch: &Path, stub: &Path, support: &Path) -> Config {
    let json = format!(
        r#"{{
            "watch_path": "{watch}",
            "remotes": [{{ "addr": "10.0.0.2", "module": "data" }}],
            "rsync": {{ "tool": "{tool}" }},
            "queue": {{ "window_secs": 1, "capacity": 100 }},
            "worker_count": 2,
            "fail_log": {{ "path": "{support}/fail_log.sh", "time_to_execute_secs": 600 }},
            "filter": {{ "enabled": true, "patterns": [".*\\.skipme$"] }}
        }}"#,
        watch = watch.display(),
        tool = stub.display(),
        support = support.display(),
    );
    serde_json::from_str(&json).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_write_is_replicated_after_window() {
    let tmp = TempDir::new().unwrap();
    let watch_dir = tmp.path().join("watch");
    fs::create_dir_all(&watch_dir).unwrap();
    let call_log = tmp.path().join("calls.log");
    let stub = write_logging_stub(tmp.path(), &call_log);

    let config = engine_config(&watch_dir, &stub, tmp.path());
    let mut engine = Engine::new(config).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    engine.start(shutdown_rx).await.unwrap();

    // let the watcher settle, then produce a close-write event
    tokio::time::sleep(Duration::from_millis(200)).await;
    let target = watch_dir.join("a.txt");
    write_and_sync(&target, b"payload").unwrap();

    // one coalescing window plus dispatch slack
    tokio::time::sleep(Duration::from_secs(4)).await;

    let calls = fs::read_to_string(&call_log).unwrap_or_default();
    assert!(
        calls.contains("10.0.0.2::data/a.txt"),
        "expected replication call, got: {:?}",
        calls
    );
    assert!(calls.contains(&target.display().to_string()));

    let stats = engine.stats_snapshot();
    assert!(stats.events_processed >= 1);
    assert!(stats.files_synced >= 1);
    assert!(stats.watcher_running);

    shutdown_tx.send(true).unwrap();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_filtered_paths_never_reach_the_dispatcher() {
    let tmp = TempDir::new().unwrap();
    let watch_dir = tmp.path().join("watch");
    fs::create_dir_all(&watch_dir).unwrap();
    let call_log = tmp.path().join("calls.log");
    let stub = write_logging_stub(tmp.path(), &call_log);

    let config = engine_config(&watch_dir, &stub, tmp.path());
    let mut engine = Engine::new(config).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    engine.start(shutdown_rx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // built-in temp pattern and a user pattern
    write_and_sync(&watch_dir.join(".hidden.swp"), b"swap").unwrap();
    write_and_sync(&watch_dir.join("scratch.skipme"), b"scratch").unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    let calls = fs::read_to_string(&call_log).unwrap_or_default();
    assert!(!calls.contains(".hidden.swp"), "temp file must be filtered");
    assert!(!calls.contains("scratch.skipme"), "user pattern must be filtered");

    let stats = engine.stats_snapshot();
    assert!(stats.files_filtered >= 2);
    assert_eq!(stats.files_synced, 0);

    shutdown_tx.send(true).unwrap();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_sync_without_start() {
    let tmp = TempDir::new().unwrap();
    let watch_dir = tmp.path().join("watch");
    fs::create_dir_all(&watch_dir).unwrap();
    fs::write(watch_dir.join("seed.txt"), b"seed").unwrap();
    let call_log = tmp.path().join("calls.log");
    let stub = write_logging_stub(tmp.path(), &call_log);

    let config = engine_config(&watch_dir, &stub, tmp.path());
    let engine = Engine::new(config).unwrap();

    let outcome = engine.full_sync().await;
    assert!(outcome.all_success);

    let calls = fs::read_to_string(&call_log).unwrap();
    assert!(calls.contains("--delete"));
    assert!(calls.contains(&format!("{}/", watch_dir.display())));
    assert!(calls.contains("10.0.0.2::data/"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_engine_refuses_metadata_inside_watched_tree() {
    let tmp = TempDir::new().unwrap();
    let watch_dir = tmp.path().join("watch");
    fs::create_dir_all(&watch_dir).unwrap();

    let json = format!(
        r#"{{
            "watch_path": "{watch}",
            "remotes": [{{
                "addr": "10.0.0.2", "module": "data", "mode": "twoway",
                "metadata_dir": "{watch}/.meta"
            }}],
            "bidirectional": {{ "enabled": true, "metadata_base_dir": "{base}" }}
        }}"#,
        watch = watch_dir.display(),
        base = tmp.path().join("meta").display(),
    );
    let config: Config = serde_json::from_str(&json).unwrap();

    assert!(Engine::new(config).is_err(), "engine must refuse to start");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_stop_drains_pending_window() {
    let tmp = TempDir::new().unwrap();
    let watch_dir = tmp.path().join("watch");
    fs::create_dir_all(&watch_dir).unwrap();
    let call_log = tmp.path().join("calls.log");
    let stub = write_logging_stub(tmp.path(), &call_log);

    let config = engine_config(&watch_dir, &stub, tmp.path());
    let mut engine = Engine::new(config).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    engine.start(shutdown_rx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    write_and_sync(&watch_dir.join("late.txt"), b"late").unwrap();
    // give the watcher a moment to deliver, then stop before the window closes
    tokio::time::sleep(Duration::from_millis(300)).await;

    shutdown_tx.send(true).unwrap();
    engine.stop().await;

    let calls = fs::read_to_string(&call_log).unwrap_or_default();
    assert!(
        calls.contains("late.txt"),
        "pending window must be drained on stop, got: {:?}",
        calls
    );
}
