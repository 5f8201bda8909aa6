//! Conflict detector case analysis and resolver strategies.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use driftsync::bidir::detect::{Conflict, ConflictDetector, ConflictKind, FileMetadata};
use driftsync::bidir::resolve::{ConflictResolver, ResolutionStrategy};
use driftsync::bidir::Side;
use tempfile::TempDir;

fn detector() -> ConflictDetector {
    ConflictDetector::new(Duration::from_secs(2), true)
}

fn meta(mtime: f64, size: u64, hash: &str) -> FileMetadata {
    FileMetadata {
        path: PathBuf::from("/w/p"),
        exists: true,
        mtime: Some(mtime),
        size: Some(size),
        content_hash: Some(hash.to_string()),
    }
}

fn missing() -> FileMetadata {
    FileMetadata::missing(PathBuf::from("/w/p"))
}

#[test]
fn test_neither_side_exists_is_no_conflict() {
    assert!(detector().detect(&missing(), &missing(), None).is_none());
}

#[test]
fn test_remote_deleted_local_modified() {
    let conflict = detector()
        .detect(&meta(100.0, 5, "a"), &missing(), Some(&meta(50.0, 4, "b")))
        .unwrap();
    assert_eq!(conflict.kind, ConflictKind::RemoteDeletedLocalModified);
}

#[test]
fn test_local_deleted_remote_modified() {
    let conflict = detector()
        .detect(&missing(), &meta(100.0, 5, "a"), Some(&meta(50.0, 4, "b")))
        .unwrap();
    assert_eq!(conflict.kind, ConflictKind::LocalDeletedRemoteModified);
}

#[test]
fn test_one_sided_creation_propagates_without_conflict() {
    // no base version: the file is simply new on one side
    assert!(detector().detect(&meta(100.0, 5, "a"), &missing(), None).is_none());
    assert!(detector().detect(&missing(), &meta(100.0, 5, "a"), None).is_none());
}

#[test]
fn test_both_created_differently_conflicts() {
    let base = missing();
    let conflict = detector()
        .detect(&meta(100.0, 5, "a"), &meta(100.0, 7, "b"), Some(&base))
        .unwrap();
    assert_eq!(conflict.kind, ConflictKind::BothCreated);
}

#[test]
fn test_both_created_identically_is_no_conflict() {
    let base = missing();
    assert!(detector()
        .detect(&meta(100.0, 5, "a"), &meta(100.0, 5, "a"), Some(&base))
        .is_none());
}

#[test]
fn test_identical_files_are_no_conflict() {
    assert!(detector()
        .detect(&meta(100.0, 5, "a"), &meta(100.0, 5, "a"), None)
        .is_none());
}

#[test]
fn test_both_modified_from_base_conflicts() {
    // local mtime 100, remote mtime 120, base 50, all different content
    let conflict = detector()
        .detect(
            &meta(100.0, 5, "local"),
            &meta(120.0, 5, "remote"),
            Some(&meta(50.0, 5, "base")),
        )
        .unwrap();
    assert_eq!(conflict.kind, ConflictKind::BothModified);
}

#[test]
fn test_single_side_modification_is_no_conflict() {
    // remote matches base, local diverged: local wins without conflict
    assert!(detector()
        .detect(
            &meta(100.0, 6, "new"),
            &meta(50.0, 5, "base"),
            Some(&meta(50.0, 5, "base")),
        )
        .is_none());
}

#[test]
fn test_mtime_tolerance_treats_near_times_as_identical() {
    // hashes unavailable: within 2 s drift counts as the same file
    let detector = ConflictDetector::new(Duration::from_secs(2), false);
    let a = FileMetadata {
        content_hash: None,
        ..meta(100.0, 5, "")
    };
    let b = FileMetadata {
        content_hash: None,
        ..meta(101.5, 5, "")
    };
    assert!(detector.files_identical(&a, &b));

    let c = FileMetadata {
        content_hash: None,
        ..meta(105.0, 5, "")
    };
    assert!(!detector.files_identical(&a, &c));
}

#[test]
fn test_detector_is_symmetric_under_side_swap() {
    // swapping local and remote mirrors the conflict type
    let detector = detector();
    let cases: Vec<(FileMetadata, FileMetadata, Option<FileMetadata>)> = vec![
        (meta(100.0, 5, "a"), missing(), Some(meta(50.0, 4, "b"))),
        (missing(), meta(100.0, 5, "a"), Some(meta(50.0, 4, "b"))),
        (meta(100.0, 5, "a"), meta(120.0, 5, "b"), Some(meta(50.0, 5, "c"))),
        (meta(100.0, 5, "a"), meta(100.0, 7, "b"), Some(missing())),
        (meta(100.0, 5, "a"), meta(100.0, 5, "a"), None),
    ];

    for (local, remote, base) in cases {
        let forward = detector.detect(&local, &remote, base.as_ref()).map(|c| c.kind);
        let swapped = detector.detect(&remote, &local, base.as_ref()).map(|c| c.kind);
        assert_eq!(forward.map(|k| k.mirrored()), swapped);
    }
}

#[test]
fn test_from_local_snapshots_real_files() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("data.bin");
    fs::write(&file, b"hello world").unwrap();

    let meta = FileMetadata::from_local(&file);
    assert!(meta.exists);
    assert_eq!(meta.size, Some(11));
    assert!(meta.mtime.unwrap() > 0.0);
    assert!(meta.content_hash.is_some(), "small files are hashed");

    let gone = FileMetadata::from_local(&tmp.path().join("nope"));
    assert!(!gone.exists);
}

// --- resolver ---

fn conflict_with(local: FileMetadata, remote: FileMetadata) -> Conflict {
    detector()
        .detect(&local, &remote, Some(&meta(1.0, 1, "base")))
        .expect("fixture must conflict")
}

fn resolver(dir: &Path, strategy: ResolutionStrategy) -> ConflictResolver {
    ConflictResolver::new(strategy, dir.join("backups"), true, None)
}

/// Both-modified conflict whose local side is a real file on disk.
fn disk_conflict(tmp: &TempDir, local_mtime: f64, remote_mtime: f64) -> Conflict {
    let local_file = tmp.path().join("doc.txt");
    fs::write(&local_file, b"local version").unwrap();
    let local = FileMetadata {
        path: local_file,
        exists: true,
        mtime: Some(local_mtime),
        size: Some(13),
        content_hash: Some("local".to_string()),
    };
    let remote = FileMetadata {
        path: PathBuf::from("doc.txt"),
        exists: true,
        mtime: Some(remote_mtime),
        size: Some(20),
        content_hash: Some("remote".to_string()),
    };
    conflict_with(local, remote)
}

#[test]
fn test_keep_newer_selects_remote_and_backs_up_local() {
    let tmp = TempDir::new().unwrap();
    // local mtime 100, remote mtime 120: remote wins, local preserved
    let conflict = disk_conflict(&tmp, 100.0, 120.0);
    let resolution = resolver(tmp.path(), ResolutionStrategy::KeepNewer).resolve(&conflict, None);

    assert!(resolution.success);
    assert_eq!(resolution.description, "use remote (newer)");
    let backup = resolution.backups.get(&Side::Local).expect("local backed up");
    assert!(backup.exists());
    assert!(backup
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("doc_local_"));
}

#[test]
fn test_keep_newer_selects_local_when_newer() {
    let tmp = TempDir::new().unwrap();
    let conflict = disk_conflict(&tmp, 200.0, 120.0);
    let resolution = resolver(tmp.path(), ResolutionStrategy::KeepNewer).resolve(&conflict, None);
    assert_eq!(resolution.description, "use local (newer)");
}

#[test]
fn test_keep_newer_without_mtimes_falls_back_to_local() {
    let tmp = TempDir::new().unwrap();
    let local = FileMetadata {
        mtime: None,
        ..meta(0.0, 5, "a")
    };
    let remote = FileMetadata {
        mtime: None,
        ..meta(0.0, 6, "b")
    };
    let conflict = conflict_with(local, remote);
    let resolution = resolver(tmp.path(), ResolutionStrategy::KeepNewer).resolve(&conflict, None);
    assert_eq!(resolution.description, "use local (default)");
}

#[test]
fn test_keep_larger_compares_sizes() {
    let tmp = TempDir::new().unwrap();
    let conflict = conflict_with(meta(100.0, 50, "a"), meta(120.0, 10, "b"));
    let resolution = resolver(tmp.path(), ResolutionStrategy::KeepLarger).resolve(&conflict, None);
    assert!(resolution.description.starts_with("use local (larger"));
}

#[test]
fn test_keep_local_and_keep_remote_are_unconditional() {
    let tmp = TempDir::new().unwrap();
    let conflict = conflict_with(meta(100.0, 5, "a"), meta(200.0, 5, "b"));

    let local = resolver(tmp.path(), ResolutionStrategy::KeepLocal).resolve(&conflict, None);
    assert_eq!(local.description, "use local (policy)");

    let remote = resolver(tmp.path(), ResolutionStrategy::KeepRemote).resolve(&conflict, None);
    assert_eq!(remote.description, "use remote (policy)");
}

#[test]
fn test_backup_both_preserves_both_versions() {
    let tmp = TempDir::new().unwrap();
    let local_file = tmp.path().join("both.txt");
    let remote_file = tmp.path().join("both_remote.txt");
    fs::write(&local_file, b"local").unwrap();
    fs::write(&remote_file, b"remote").unwrap();

    let local = FileMetadata::from_local(&local_file);
    let remote = FileMetadata::from_local(&remote_file);
    // force distinct identities so the pair conflicts
    let remote = FileMetadata {
        mtime: Some(local.mtime.unwrap() + 100.0),
        content_hash: Some("other".to_string()),
        ..remote
    };
    let conflict = conflict_with(local, remote);

    let resolution = resolver(tmp.path(), ResolutionStrategy::BackupBoth).resolve(&conflict, None);
    assert!(resolution.success);
    assert!(resolution.backups[&Side::Local].exists());
    assert!(resolution.backups[&Side::Remote].exists());
}

#[test]
fn test_skip_takes_no_action() {
    let tmp = TempDir::new().unwrap();
    let conflict = conflict_with(meta(100.0, 5, "a"), meta(200.0, 5, "b"));
    let resolution = resolver(tmp.path(), ResolutionStrategy::Skip).resolve(&conflict, None);
    assert!(resolution.success);
    assert!(resolution.backups.is_empty());
}

#[test]
fn test_manual_consults_handler() {
    let tmp = TempDir::new().unwrap();
    let resolver = ConflictResolver::new(
        ResolutionStrategy::Manual,
        tmp.path().join("backups"),
        true,
        Some(Box::new(|_conflict| ResolutionStrategy::KeepLocal)),
    );
    let conflict = conflict_with(meta(100.0, 5, "a"), meta(200.0, 5, "b"));
    let resolution = resolver.resolve(&conflict, None);
    assert_eq!(resolution.strategy_used, ResolutionStrategy::KeepLocal);
}

#[test]
fn test_manual_without_handler_backs_up_both() {
    let tmp = TempDir::new().unwrap();
    let conflict = conflict_with(meta(100.0, 5, "a"), meta(200.0, 5, "b"));
    let resolution = resolver(tmp.path(), ResolutionStrategy::Manual).resolve(&conflict, None);
    assert_eq!(resolution.strategy_used, ResolutionStrategy::BackupBoth);
}

#[test]
fn test_mirrored_kinds() {
    assert_eq!(
        ConflictKind::LocalDeletedRemoteModified.mirrored(),
        ConflictKind::RemoteDeletedLocalModified
    );
    assert_eq!(
        ConflictKind::RemoteDeletedLocalModified.mirrored(),
        ConflictKind::LocalDeletedRemoteModified
    );
    assert_eq!(ConflictKind::BothModified.mirrored(), ConflictKind::BothModified);
    assert_eq!(ConflictKind::BothCreated.mirrored(), ConflictKind::BothCreated);
    assert_eq!(ConflictKind::MoveConflict.mirrored(), ConflictKind::MoveConflict);
}
