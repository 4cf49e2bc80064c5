//! End-to-end workspace scenarios.
//!
//! Every test runs real engines against a real remote scope:
//! - a bare remote scope directory opened through the local transport
//! - a "publisher" workspace that authors and exports components
//! - a "consumer" workspace that imports them and diverges
//!
//! No network I/O: remotes are plain directories.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use scopesync_core::config::WorkspaceConfig;
use scopesync_core::errors::{ConflictError, CoreError, SyncError};
use scopesync_core::workspace::EntryChange;
use scopesync_core::{Engine, ExportOptions, ImportOptions, MergeStrategy, Scope, TagOptions};

// ===========================================================================
// Helpers
// ===========================================================================

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

fn workspace(root: &Path, remote: &Path) -> Engine {
    let engine = Engine::init(root, WorkspaceConfig::new("bar")).unwrap();
    engine.add_remote("origin", remote.to_str().unwrap()).unwrap();
    engine
}

fn export_all(engine: &Engine) -> Result<scopesync_core::engine::ExportReport, CoreError> {
    engine.export(&ExportOptions {
        ids: vec![],
        remote: "origin".into(),
    })
}

fn import(engine: &Engine, ids: &[&str], merge: Option<MergeStrategy>) -> Result<scopesync_core::engine::ImportReport, CoreError> {
    engine.import(&ImportOptions {
        ids: ids.iter().map(|s| s.to_string()).collect(),
        remote: "origin".into(),
        merge,
        ..Default::default()
    })
}

fn tag_all(engine: &Engine) {
    engine.tag(&TagOptions::default()).unwrap();
}

struct Fixture {
    _dir: TempDir,
    publisher_root: PathBuf,
    consumer_root: PathBuf,
    publisher: Engine,
    consumer: Engine,
}

/// `bar/foo` exported at 0.0.1, imported by the consumer, then moved to
/// 0.0.2 on the remote while the consumer edits the same line on disk.
fn diverged() -> Fixture {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote");
    Scope::init(&remote, "bar").unwrap();

    let publisher_root = dir.path().join("publisher");
    let publisher = workspace(&publisher_root, &remote);
    write(&publisher_root, "foo/index.js", "one\n");
    publisher.add("foo", Path::new("foo")).unwrap();
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    let consumer_root = dir.path().join("consumer");
    let consumer = workspace(&consumer_root, &remote);
    let report = import(&consumer, &["bar/foo"], None).unwrap();
    assert_eq!(report.imported[0].root, "components/foo");
    assert_eq!(read(&consumer_root, "components/foo/index.js"), "one\n");

    write(&publisher_root, "foo/index.js", "theirs\n");
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    write(&consumer_root, "components/foo/index.js", "mine\n");

    Fixture {
        _dir: dir,
        publisher_root,
        consumer_root,
        publisher,
        consumer,
    }
}

// ===========================================================================
// Export
// ===========================================================================

#[test]
fn test_export_of_diverged_component_is_rejected() {
    let f = diverged();
    tag_all(&f.consumer);

    let err = export_all(&f.consumer).unwrap_err();
    match err {
        CoreError::Conflict(ConflictError::MergeConflictOnRemote {
            conflicts,
            new_on_remote,
        }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, "bar/foo");
            assert_eq!(conflicts[0].versions, vec!["0.0.2".to_string()]);
            assert!(new_on_remote.is_empty());
        }
        other => panic!("expected MergeConflictOnRemote, got {other:?}"),
    }
}

#[test]
fn test_diverged_history_merges_then_exports() {
    let f = diverged();
    tag_all(&f.consumer);

    let err = import(&f.consumer, &["bar/foo"], None).unwrap_err();
    match err {
        CoreError::Conflict(ConflictError::MergeConflict(conflict)) => {
            assert_eq!(conflict.id, "bar/foo");
            assert_eq!(conflict.versions, vec!["0.0.2".to_string()]);
        }
        other => panic!("expected MergeConflict, got {other:?}"),
    }
    // Nothing was written.
    assert_eq!(read(&f.consumer_root, "components/foo/index.js"), "mine\n");

    import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();
    assert_eq!(read(&f.consumer_root, "components/foo/index.js"), "theirs\n");

    // The merge is recorded by the next tag even though the content matches
    // the incoming version.
    let tagged = f.consumer.tag(&TagOptions::default()).unwrap();
    assert_eq!(tagged[0].to_string(), "bar/foo@0.0.3");
    let ledger = f.consumer.scope().load_ledger("bar/foo").unwrap().unwrap();
    assert_eq!(ledger.head_version().unwrap().parents.len(), 2);

    let report = export_all(&f.consumer).unwrap();
    assert_eq!(report.exported, vec!["bar/foo@0.0.3".to_string()]);

    // The publisher fast-forwards to the merge.
    let report = import(&f.publisher, &["bar/foo"], None).unwrap();
    assert_eq!(report.imported[0].version, "0.0.3");
    assert_eq!(report.imported[0].root, "foo");
    assert_eq!(read(&f.publisher_root, "foo/index.js"), "theirs\n");
}

#[test]
fn test_export_is_idempotent() {
    let f = diverged();
    let report = export_all(&f.publisher).unwrap();
    assert!(report.exported.is_empty());

    let report = f
        .publisher
        .export(&ExportOptions {
            ids: vec!["foo".into()],
            remote: "origin".into(),
        })
        .unwrap();
    assert!(report.exported.is_empty());
    assert_eq!(report.up_to_date, vec!["bar/foo".to_string()]);
}

// ===========================================================================
// Import with local modifications
// ===========================================================================

#[test]
fn test_import_without_merge_is_blocked_by_modifications() {
    let f = diverged();
    let err = import(&f.consumer, &["bar/foo"], None).unwrap_err();
    match err {
        CoreError::Conflict(ConflictError::ImportBlocked {
            conflicts,
            modified,
            unrelated,
        }) => {
            assert!(conflicts.is_empty());
            assert!(unrelated.is_empty());
            assert_eq!(modified, vec!["bar/foo".to_string()]);
        }
        other => panic!("expected ImportBlocked, got {other:?}"),
    }
    assert_eq!(read(&f.consumer_root, "components/foo/index.js"), "mine\n");
}

#[test]
fn test_import_manual_merge_writes_markers() {
    let f = diverged();
    let report = import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Manual)).unwrap();
    let imported = &report.imported[0];
    assert_eq!(imported.version, "0.0.2");
    assert_eq!(imported.strategy, Some(MergeStrategy::Manual));
    assert_eq!(imported.conflicted_files, vec!["index.js".to_string()]);
    assert!(imported.modified);

    let merged = read(&f.consumer_root, "components/foo/index.js");
    let lines: Vec<&str> = merged.lines().collect();
    assert!(lines.contains(&"<<<<<<< 0.0.1 modified"));
    assert!(lines.contains(&"mine"));
    assert!(lines.contains(&"======="));
    assert!(lines.contains(&"theirs"));
    assert!(lines.contains(&">>>>>>> 0.0.2"));

    let status = f.consumer.status().unwrap();
    let foo = &status.components[0];
    assert_eq!(foo.id, "bar/foo");
    assert_eq!(foo.version.as_deref(), Some("0.0.2"));
    assert!(foo.modified);
}

#[test]
fn test_import_theirs_takes_incoming_version() {
    let f = diverged();
    let report = import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();
    assert!(!report.imported[0].modified);
    assert!(report.imported[0].conflicted_files.is_empty());
    assert_eq!(read(&f.consumer_root, "components/foo/index.js"), "theirs\n");

    let status = f.consumer.status().unwrap();
    assert!(!status.components[0].modified);
    assert_eq!(status.components[0].version.as_deref(), Some("0.0.2"));
}

#[test]
fn test_import_ours_keeps_local_content() {
    let f = diverged();
    let report = import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Ours)).unwrap();
    assert!(report.imported[0].modified);
    assert_eq!(read(&f.consumer_root, "components/foo/index.js"), "mine\n");

    let status = f.consumer.status().unwrap();
    assert!(status.components[0].modified);
    assert_eq!(status.components[0].version.as_deref(), Some("0.0.2"));
}

#[test]
fn test_import_up_to_date_component_is_skipped() {
    let f = diverged();
    import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();
    let report = import(&f.consumer, &["bar/foo"], None).unwrap();
    assert!(report.imported.is_empty());
    assert_eq!(report.up_to_date, vec!["bar/foo".to_string()]);
}

// ===========================================================================
// Unrelated histories
// ===========================================================================

#[test]
fn test_unrelated_histories_need_permission() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote");
    Scope::init(&remote, "bar").unwrap();

    let publisher_root = dir.path().join("publisher");
    let publisher = workspace(&publisher_root, &remote);
    write(&publisher_root, "foo/index.js", "remote\n");
    publisher.add("foo", Path::new("foo")).unwrap();
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    // Same id, authored independently.
    let consumer_root = dir.path().join("consumer");
    let consumer = workspace(&consumer_root, &remote);
    write(&consumer_root, "foo/index.js", "local\n");
    consumer.add("foo", Path::new("foo")).unwrap();
    tag_all(&consumer);

    let err = export_all(&consumer).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(ConflictError::MergeConflictOnRemote { ref new_on_remote, .. })
            if new_on_remote == &vec!["bar/foo".to_string()]
    ));

    let err = import(&consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap_err();
    assert!(matches!(err, CoreError::Sync(SyncError::UnrelatedHistories(_))));

    let report = consumer
        .import(&ImportOptions {
            ids: vec!["bar/foo".into()],
            remote: "origin".into(),
            merge: Some(MergeStrategy::Theirs),
            allow_unrelated: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(report.imported[0].root, "foo");
    assert_eq!(read(&consumer_root, "foo/index.js"), "remote\n");
}

#[test]
fn test_untagged_local_work_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote");
    Scope::init(&remote, "bar").unwrap();

    let publisher_root = dir.path().join("publisher");
    let publisher = workspace(&publisher_root, &remote);
    write(&publisher_root, "foo/index.js", "remote\n");
    publisher.add("foo", Path::new("foo")).unwrap();
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    let consumer_root = dir.path().join("consumer");
    let consumer = workspace(&consumer_root, &remote);
    write(&consumer_root, "foo/index.js", "my unsaved work\n");
    consumer.add("foo", Path::new("foo")).unwrap();

    let err = import(&consumer, &["bar/foo"], None).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Sync(SyncError::UnrelatedHistories(ref ids)) if ids == &vec!["bar/foo".to_string()]
    ));
    assert_eq!(read(&consumer_root, "foo/index.js"), "my unsaved work\n");

    let allow = |merge| ImportOptions {
        ids: vec!["bar/foo".into()],
        remote: "origin".into(),
        merge,
        allow_unrelated: true,
        ..Default::default()
    };
    let err = consumer.import(&allow(None)).unwrap_err();
    assert!(matches!(err, CoreError::Conflict(ConflictError::MergeConflict(_))));
    assert_eq!(read(&consumer_root, "foo/index.js"), "my unsaved work\n");

    let report = consumer.import(&allow(Some(MergeStrategy::Ours))).unwrap();
    assert_eq!(report.imported[0].root, "foo");
    assert!(report.imported[0].modified);
    assert_eq!(read(&consumer_root, "foo/index.js"), "my unsaved work\n");
}

#[test]
fn test_import_reports_conflicts_and_unrelated_together() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote");
    Scope::init(&remote, "bar").unwrap();

    let publisher_root = dir.path().join("publisher");
    let publisher = workspace(&publisher_root, &remote);
    write(&publisher_root, "a/index.js", "one\n");
    write(&publisher_root, "u/index.js", "remote\n");
    publisher.add("a", Path::new("a")).unwrap();
    publisher.add("u", Path::new("u")).unwrap();
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    let consumer_root = dir.path().join("consumer");
    let consumer = workspace(&consumer_root, &remote);
    import(&consumer, &["bar/a"], None).unwrap();
    write(&consumer_root, "u/index.js", "local\n");
    consumer.add("u", Path::new("u")).unwrap();

    write(&publisher_root, "a/index.js", "theirs\n");
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    write(&consumer_root, "components/a/index.js", "mine\n");
    tag_all(&consumer);

    let err = import(&consumer, &[], None).unwrap_err();
    match err {
        CoreError::Conflict(ConflictError::ImportBlocked {
            conflicts,
            modified,
            unrelated,
        }) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, "bar/a");
            assert!(modified.is_empty());
            assert_eq!(unrelated, vec!["bar/u".to_string()]);
        }
        other => panic!("expected ImportBlocked, got {other:?}"),
    }
    assert_eq!(read(&consumer_root, "components/a/index.js"), "mine\n");
    assert_eq!(read(&consumer_root, "u/index.js"), "local\n");
}

// ===========================================================================
// Root collisions
// ===========================================================================

#[test]
fn test_parent_root_is_renamed_on_import() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote");
    Scope::init(&remote, "bar").unwrap();

    let publisher_root = dir.path().join("publisher");
    let publisher = workspace(&publisher_root, &remote);
    write(&publisher_root, "a/index.js", "a\n");
    write(&publisher_root, "b/index.js", "b\n");
    publisher.add("a", Path::new("a")).unwrap();
    publisher.add("a/b", Path::new("b")).unwrap();
    tag_all(&publisher);
    export_all(&publisher).unwrap();

    let consumer_root = dir.path().join("consumer");
    let consumer = workspace(&consumer_root, &remote);
    let report = import(&consumer, &["bar/a", "bar/a/b"], None).unwrap();

    let a = report.imported.iter().find(|c| c.id == "bar/a").unwrap();
    let ab = report.imported.iter().find(|c| c.id == "bar/a/b").unwrap();
    assert_eq!(a.root, "components/a_1");
    assert_eq!(a.renamed_from.as_deref(), Some("components/a"));
    assert_eq!(ab.root, "components/a/b");
    assert!(ab.renamed_from.is_none());

    assert_eq!(read(&consumer_root, "components/a_1/index.js"), "a\n");
    assert_eq!(read(&consumer_root, "components/a/b/index.js"), "b\n");
    assert!(!consumer_root.join(".scope/staging").read_dir().unwrap().any(|e| {
        e.map(|e| e.path().is_dir()).unwrap_or(false)
    }));
}

// ===========================================================================
// Status
// ===========================================================================

#[test]
fn test_status_is_idempotent() {
    let f = diverged();
    import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();

    let first = f.consumer.status().unwrap();
    assert!(!first.stale);
    let bitmap = read(&f.consumer_root, ".bitmap");

    let second = f.consumer.status().unwrap();
    assert!(!second.stale);
    assert!(second.changes.iter().all(EntryChange::is_unchanged));
    assert_eq!(read(&f.consumer_root, ".bitmap"), bitmap);
}

#[test]
fn test_status_flags_map_behind_the_scope() {
    let f = diverged();
    import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();
    let old_bitmap = read(&f.consumer_root, ".bitmap");

    // Move the head behind the saved map's back.
    write(&f.consumer_root, "components/foo/index.js", "newer\n");
    tag_all(&f.consumer);
    fs::write(f.consumer_root.join(".bitmap"), old_bitmap).unwrap();

    let status = f.consumer.status().unwrap();
    assert!(status.stale);
    // 0.0.2 still resolves, so the entry keeps it.
    assert_eq!(status.components[0].version.as_deref(), Some("0.0.2"));
    assert!(!f.consumer.status().unwrap().stale);
}

#[test]
fn test_status_restores_entries_known_to_the_scope() {
    let f = diverged();
    import(&f.consumer, &["bar/foo"], Some(MergeStrategy::Theirs)).unwrap();

    fs::remove_file(f.consumer_root.join(".bitmap")).unwrap();
    let status = f.consumer.status().unwrap();
    assert_eq!(status.components.len(), 1);
    assert_eq!(status.components[0].id, "bar/foo");
    assert_eq!(status.components[0].version.as_deref(), Some("0.0.2"));
    assert!(matches!(status.changes[0], EntryChange::Added { .. }));
}
