//! Metadata store: slug namespacing, node identity, atomic state writes,
//! containment refusal, backup rotation.

use std::fs;
use std::path::Path;

use driftsync::bidir::metadata::{derive_slug, MetadataOverrides, MetadataStore};
use driftsync::config::ConfigError;
use tempfile::TempDir;

fn store(watch: &Path, base: &Path) -> MetadataStore {
    MetadataStore::new(watch, "data", base, &MetadataOverrides::default(), None).unwrap()
}

#[test]
fn test_slug_is_deterministic_and_short() {
    let a = derive_slug(Path::new("/w"), "data");
    let b = derive_slug(Path::new("/w"), "data");
    let c = derive_slug(Path::new("/w"), "mirror");

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 8);
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
}

#[test]
fn test_store_creates_layout_and_persists_node_id() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    let base = tmp.path().join("meta");
    fs::create_dir_all(&watch).unwrap();

    let first = store(&watch, &base);
    let node_id = first.node_id().to_string();
    assert!(node_id.starts_with("node-"));
    assert!(first.state_file().parent().unwrap().is_dir());
    assert!(first.conflict_dir().is_dir());

    // a second store over the same pair sees the same identity
    let second = store(&watch, &base);
    assert_eq!(second.node_id(), node_id);
}

#[test]
fn test_override_inside_watched_tree_is_refused() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();

    let overrides = MetadataOverrides {
        state_dir: Some(watch.join(".meta")),
        ..MetadataOverrides::default()
    };
    let result = MetadataStore::new(
        &watch,
        "data",
        &tmp.path().join("meta"),
        &overrides,
        None,
    );
    assert!(matches!(
        result,
        Err(ConfigError::InsideWatchedTree { .. })
    ));
}

#[test]
fn test_base_dir_inside_watched_tree_is_refused() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();

    let result = MetadataStore::new(
        &watch,
        "data",
        &watch.join("bidir"),
        &MetadataOverrides::default(),
        None,
    );
    assert!(result.is_err());
}

#[test]
fn test_update_and_remove_round_trip_with_version_bumps() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let store = store(&watch, &tmp.path().join("meta"));

    let initial_version = store.load().version;
    store.update_file("a.txt", 100.0, 5, Some("abc".to_string())).unwrap();

    let recorded = store.file_state("a.txt").unwrap();
    assert_eq!(recorded.mtime, 100.0);
    assert_eq!(recorded.size, 5);
    assert_eq!(recorded.checksum.as_deref(), Some("abc"));
    assert_eq!(recorded.last_modified_by, store.node_id());
    assert!(store.load().version > initial_version);

    store.remove_file("a.txt").unwrap();
    assert!(store.file_state("a.txt").is_none());
}

#[test]
fn test_malformed_state_file_rebuilds_empty_state() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let store = store(&watch, &tmp.path().join("meta"));

    store.update_file("a.txt", 100.0, 5, None).unwrap();
    // simulate a corrupted write from a previous crash
    fs::write(store.state_file(), b"{ truncated garba").unwrap();

    let state = store.load();
    assert!(state.files.is_empty());
    assert_eq!(state.version, 1);
    assert_eq!(state.node_id, store.node_id());
}

#[test]
fn test_save_leaves_no_temp_artefacts() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let store = store(&watch, &tmp.path().join("meta"));

    store.update_file("a.txt", 1.0, 1, None).unwrap();
    store.update_file("b.txt", 2.0, 2, None).unwrap();

    let state_dir = store.state_file().parent().unwrap().to_path_buf();
    let leftovers: Vec<_> = fs::read_dir(&state_dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "sync_state.json" && name != "node_id")
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
}

#[test]
fn test_state_survives_reload_after_save() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();

    {
        let store = store(&watch, &tmp.path().join("meta"));
        store.update_file("kept.txt", 42.0, 9, None).unwrap();
    }
    let reopened = store(&watch, &tmp.path().join("meta"));
    assert!(reopened.file_state("kept.txt").is_some());
}

#[test]
fn test_conflict_backup_naming_includes_node_and_marker() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let store = store(&watch, &tmp.path().join("meta"));

    let backup = store.conflict_backup("report.txt", b"old content").unwrap();
    let name = backup.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("report.txt.conflict."));
    assert!(name.ends_with(store.node_id()));
    assert_eq!(fs::read(&backup).unwrap(), b"old content");
}

#[test]
fn test_backup_rotation_keeps_newest() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let store = store(&watch, &tmp.path().join("meta"));

    let mut backups = Vec::new();
    for i in 0..5 {
        let backup = store
            .conflict_backup(&format!("f{}.txt", i), b"v")
            .unwrap();
        backups.push(backup);
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    store.rotate_backups(2);

    let remaining: Vec<_> = backups.iter().filter(|p| p.exists()).collect();
    assert_eq!(remaining.len(), 2);
    // the two newest survive
    assert!(backups[3].exists());
    assert!(backups[4].exists());
}

#[test]
fn test_refresh_from_disk_records_tree_contents() {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(watch.join("sub")).unwrap();
    fs::write(watch.join("a.txt"), b"one").unwrap();
    fs::write(watch.join("sub/b.txt"), b"two").unwrap();

    let store = store(&watch, &tmp.path().join("meta"));
    let count = store.refresh_from_disk(None).unwrap();

    assert_eq!(count, 2);
    let state = store.load();
    assert!(state.files.contains_key("a.txt"));
    assert!(state.files.contains_key("sub/b.txt"));
    assert!(state.last_sync.is_some());
}
