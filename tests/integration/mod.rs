//! Integration tests for rewind
//!
//! End-to-end scenarios through the public [`SnapshotEngine`] API: capture,
//! incremental detection, conflict-aware rollback, retention and referential
//! integrity between the index and the blob store.

use ::rewind::*;
use filetime::{set_file_mtime, FileTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test harness owning a project directory, a separate storage directory and
/// an engine over both
pub struct RewindTestHarness {
    pub root_dir: TempDir,
    pub storage_dir: TempDir,
    pub engine: SnapshotEngine,
}

/// Configuration used by the harness: no automatic retention
pub fn test_config() -> RewindConfig {
    let mut config = RewindConfig::default();
    config.storage.auto_cleanup = false;
    config
}

impl RewindTestHarness {
    /// Create a harness with [`test_config`]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a harness with a custom configuration
    pub fn with_config(config: RewindConfig) -> Self {
        let root_dir = TempDir::new().unwrap();
        let storage_dir = TempDir::new().unwrap();
        let engine = Self::open_engine(&root_dir, &storage_dir, config);
        Self {
            root_dir,
            storage_dir,
            engine,
        }
    }

    fn open_engine(root_dir: &TempDir, storage_dir: &TempDir, config: RewindConfig) -> SnapshotEngine {
        EngineBuilder::new()
            .config(config)
            .storage_path(storage_dir.path())
            .background_retention(false)
            .build(root_dir.path().to_path_buf())
            .unwrap()
    }

    /// Drop the engine and open a fresh one over the same directories
    pub fn reopen(self) -> Self {
        let Self {
            root_dir,
            storage_dir,
            engine,
        } = self;
        let config = engine.config().clone();
        drop(engine);
        let engine = Self::open_engine(&root_dir, &storage_dir, config);
        Self {
            root_dir,
            storage_dir,
            engine,
        }
    }

    pub fn root(&self) -> &Path {
        self.root_dir.path()
    }

    pub fn write(&self, path: &str, content: impl AsRef<[u8]>) {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }

    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.root().join(path)).ok()
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.root().join(path)).unwrap();
    }

    /// Pin a file's mtime so signature comparisons are deterministic
    pub fn pin_mtime(&self, path: &str, unix_secs: i64) {
        set_file_mtime(self.root().join(path), FileTime::from_unix_time(unix_secs, 0)).unwrap();
    }

    pub fn snapshot(&self, action: &str) -> SnapshotId {
        self.engine.create_snapshot(ActionContext::new(action)).unwrap()
    }

    /// Every regular file under the root with its content
    pub fn tree(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(self.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let relative = e.path().strip_prefix(self.root()).unwrap().to_path_buf();
                (relative, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    /// Path of the blob for `content` in the store
    pub fn object_path(&self, content: &[u8]) -> PathBuf {
        let hash = utils::hash_data(content);
        self.storage_dir
            .path()
            .join("objects")
            .join(&hash[..2])
            .join(&hash[2..])
    }
}

impl Default for RewindTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic project generator
pub struct ProjectGenerator {
    rng: StdRng,
}

impl ProjectGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Write `count` files spread over a few directories
    pub fn populate(&mut self, harness: &RewindTestHarness, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let path = format!("dir_{}/file_{}.txt", i % 4, i);
                let len = self.rng.random_range(16..2048);
                let content: String = (0..len)
                    .map(|_| self.rng.random_range(b'a'..=b'z') as char)
                    .collect();
                harness.write(&path, content);
                path
            })
            .collect()
    }
}

fn changed_paths(changes: &[FileChange]) -> Vec<(String, ChangeType)> {
    changes
        .iter()
        .map(|c| (c.file_path.to_string_lossy().to_string(), c.change_type))
        .collect()
}

#[test]
fn test_end_to_end_incremental_and_rollback() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    h.write("b.txt", "2");
    h.pin_mtime("a.txt", 1_000_000);
    h.pin_mtime("b.txt", 1_000_000);
    let s1 = h.snapshot("initial");
    assert_eq!(h.engine.get_snapshot(&s1).unwrap().files_affected, 2);

    h.write("a.txt", "11");
    h.pin_mtime("a.txt", 1_000_100);
    let s2 = h.snapshot("edit");
    assert_eq!(
        changed_paths(&h.engine.get_file_changes(&s2).unwrap()),
        vec![("a.txt".to_string(), ChangeType::Modified)]
    );
    let stats = h.engine.incremental_stats();
    assert_eq!(stats.last_scan_rehashed, 1);
    assert_eq!(stats.last_scan_reused, 1);

    h.remove("b.txt");
    let s3 = h.snapshot("delete");
    assert_eq!(
        changed_paths(&h.engine.get_file_changes(&s3).unwrap()),
        vec![("b.txt".to_string(), ChangeType::Deleted)]
    );

    let result = h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert!(result.conflicts_overwritten.is_empty());
    assert_eq!(h.read("a.txt").as_deref(), Some("1"));
    assert_eq!(h.read("b.txt").as_deref(), Some("2"));

    let s3_meta = h.engine.get_snapshot(&s3).unwrap();
    assert_eq!(s3_meta.parent_snapshot.as_deref(), Some(s2.as_str()));
}

#[test]
fn test_unchanged_snapshot_writes_nothing() {
    let h = RewindTestHarness::new();
    ProjectGenerator::new(42).populate(&h, 20);

    let s1 = h.snapshot("first");
    let blobs_after_first = h.engine.storage_stats().unwrap().store.object_count;

    let s2 = h.snapshot("second");
    assert!(h.engine.get_file_changes(&s2).unwrap().is_empty());
    assert_eq!(h.engine.get_snapshot(&s2).unwrap().files_affected, 0);
    assert_eq!(h.engine.storage_stats().unwrap().store.object_count, blobs_after_first);
    assert_eq!(
        h.engine.get_snapshot_files(&s1).unwrap(),
        h.engine.get_snapshot_files(&s2).unwrap()
    );
}

#[test]
fn test_identical_content_is_stored_once() {
    let h = RewindTestHarness::new();
    h.write("one.txt", "same bytes");
    h.write("nested/two.txt", "same bytes");
    h.write("other.txt", "different");
    h.snapshot("dedup");

    let stats = h.engine.storage_stats().unwrap();
    assert_eq!(stats.store.object_count, 2);
    assert_eq!(stats.index.referenced_blob_count, 2);
}

#[test]
fn test_conflicts_are_reported_and_preserved() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "v1");
    let s1 = h.snapshot("first");
    h.write("a.txt", "v2");
    let _s2 = h.snapshot("second");

    // Edits nobody captured
    h.write("a.txt", "manual");
    h.write("new.txt", "untracked");

    let preview = h.engine.preview_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert_eq!(preview.to_restore, vec![PathBuf::from("a.txt")]);
    assert_eq!(preview.to_delete, vec![PathBuf::from("new.txt")]);
    let kinds: Vec<(PathBuf, ConflictKind)> =
        preview.conflicts.iter().map(|c| (c.path.clone(), c.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (PathBuf::from("a.txt"), ConflictKind::ModifiedSinceCapture),
            (PathBuf::from("new.txt"), ConflictKind::CreatedSinceCapture),
        ]
    );

    let options = RollbackOptions {
        preserve_manual_changes: true,
        ..Default::default()
    };
    let result = h.engine.execute_rollback(&s1, &options).unwrap();
    assert_eq!(result.conflicts_preserved.len(), 2);
    assert!(result.files_restored.is_empty());
    assert_eq!(h.read("a.txt").as_deref(), Some("manual"));
    assert_eq!(h.read("new.txt").as_deref(), Some("untracked"));

    let result = h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert_eq!(result.conflicts_overwritten.len(), 2);
    assert_eq!(h.read("a.txt").as_deref(), Some("v1"));
    assert!(h.read("new.txt").is_none());
    let backup = result.backup_path.expect("originals were backed up");
    assert_eq!(fs::read_to_string(backup.join("a.txt")).unwrap(), "manual");
}

#[test]
fn test_captured_changes_are_not_conflicts() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "v1");
    let s1 = h.snapshot("first");
    h.write("a.txt", "v2");
    h.write("b.txt", "added");
    h.snapshot("second");

    let preview = h.engine.preview_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert!(preview.conflicts.is_empty());
    assert_eq!(preview.to_restore, vec![PathBuf::from("a.txt")]);
    assert_eq!(preview.to_delete, vec![PathBuf::from("b.txt")]);
}

#[test]
fn test_selective_rollback_touches_only_named_files() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "a1");
    h.write("b.txt", "b1");
    let s1 = h.snapshot("first");
    h.write("a.txt", "a2");
    h.write("b.txt", "b2");
    h.write("c.txt", "c2");
    h.snapshot("second");

    let result = h
        .engine
        .execute_rollback(&s1, &RollbackOptions::selective(vec![PathBuf::from("a.txt")]))
        .unwrap();
    assert_eq!(result.files_restored, vec![PathBuf::from("a.txt")]);
    assert!(result.files_deleted.is_empty());
    assert_eq!(h.read("a.txt").as_deref(), Some("a1"));
    assert_eq!(h.read("b.txt").as_deref(), Some("b2"));
    assert_eq!(h.read("c.txt").as_deref(), Some("c2"));
}

#[test]
fn test_dry_run_changes_nothing() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "a1");
    let s1 = h.snapshot("first");
    h.write("a.txt", "a2");
    h.write("b.txt", "b2");
    h.snapshot("second");
    let before = h.tree();

    let options = RollbackOptions {
        dry_run: true,
        ..Default::default()
    };
    let result = h.engine.execute_rollback(&s1, &options).unwrap();
    assert!(result.dry_run);
    assert_eq!(result.files_restored, vec![PathBuf::from("a.txt")]);
    assert_eq!(result.files_deleted, vec![PathBuf::from("b.txt")]);
    assert_eq!(h.tree(), before);
}

#[test]
fn test_safety_snapshot_allows_undoing_a_rollback() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "old");
    let s1 = h.snapshot("first");
    h.write("a.txt", "new");
    h.snapshot("second");
    h.write("a.txt", "unsaved");

    let options = RollbackOptions {
        safety_snapshot: true,
        ..Default::default()
    };
    let result = h.engine.execute_rollback(&s1, &options).unwrap();
    let safety = result.safety_snapshot.expect("safety snapshot taken");
    // The unsaved edit is still a conflict, even though the safety snapshot holds it
    assert_eq!(result.conflicts_overwritten.len(), 1);
    assert_eq!(h.read("a.txt").as_deref(), Some("old"));
    assert_eq!(h.engine.get_snapshot(&safety).unwrap().action_type, "pre_rollback");

    h.engine.execute_rollback(&safety, &RollbackOptions::default()).unwrap();
    assert_eq!(h.read("a.txt").as_deref(), Some("unsaved"));
}

#[test]
fn test_safety_snapshot_still_preserves_manual_edits() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "old");
    h.write("b.txt", "b old");
    let s1 = h.snapshot("first");
    h.write("a.txt", "new");
    h.write("b.txt", "b new");
    h.snapshot("second");
    h.write("a.txt", "typed by hand");

    let options = RollbackOptions {
        safety_snapshot: true,
        preserve_manual_changes: true,
        ..Default::default()
    };
    let preview = h.engine.preview_rollback(&s1, &options).unwrap();
    assert_eq!(preview.conflicts.len(), 1);

    let result = h.engine.execute_rollback(&s1, &options).unwrap();
    assert!(result.safety_snapshot.is_some());
    assert_eq!(result.conflicts_preserved.len(), 1);
    assert_eq!(result.conflicts_preserved[0].path, PathBuf::from("a.txt"));
    assert_eq!(h.read("a.txt").as_deref(), Some("typed by hand"));
    assert_eq!(h.read("b.txt").as_deref(), Some("b old"));
}

#[test]
fn test_rollback_target_survives_retention_of_safety_snapshot() {
    let mut config = test_config();
    config.storage.max_snapshots = 3;
    config.storage.auto_cleanup = true;
    let h = RewindTestHarness::with_config(config);

    let ids: Vec<SnapshotId> = (0..3)
        .map(|i| {
            h.write("counter.txt", format!("{i}"));
            h.snapshot("tick")
        })
        .collect();
    h.write("counter.txt", "unsaved");

    let options = RollbackOptions {
        safety_snapshot: true,
        ..Default::default()
    };
    let result = h.engine.execute_rollback(&ids[0], &options).unwrap();
    let safety = result.safety_snapshot.expect("safety snapshot taken");
    assert_eq!(h.read("counter.txt").as_deref(), Some("0"));

    // The limit still holds; the next oldest snapshot made way instead of the target
    let remaining: Vec<SnapshotId> = h
        .engine
        .list_snapshots(&SnapshotFilter::default())
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec![ids[0].clone(), ids[2].clone(), safety]);
    assert!(h.engine.validate_integrity().unwrap().is_valid());
}

#[test]
fn test_rollback_to_unknown_snapshot() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "a");
    h.snapshot("first");
    let before = h.tree();

    let result = h.engine.execute_rollback("does-not-exist", &RollbackOptions::default());
    assert!(matches!(result, Err(RewindError::SnapshotNotFound(_))));
    assert_eq!(h.tree(), before);
}

#[test]
fn test_retention_keeps_newest_k() {
    let mut config = test_config();
    config.storage.max_snapshots = 3;
    let h = RewindTestHarness::with_config(config);

    let ids: Vec<SnapshotId> = (0..8)
        .map(|i| {
            h.write("counter.txt", format!("{i}"));
            h.snapshot("tick")
        })
        .collect();

    let report = h.engine.enforce_retention().unwrap();
    assert_eq!(report.deleted, ids[..5].to_vec());
    assert!(report
        .candidates
        .iter()
        .all(|c| c.reasons == vec![retention::RetentionReason::Count]));

    let remaining: Vec<SnapshotId> = h
        .engine
        .list_snapshots(&SnapshotFilter::default())
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, ids[5..].to_vec());

    // Idempotent
    let again = h.engine.enforce_retention().unwrap();
    assert!(again.deleted.is_empty());

    let integrity = h.engine.validate_integrity().unwrap();
    assert!(integrity.is_valid());
    assert!(integrity.orphaned_objects.is_empty());
    // The oldest survivor's change record still names its predecessor's content
    assert_eq!(h.engine.storage_stats().unwrap().store.object_count, 4);
    assert!(h.object_path(b"4").exists());
    assert!(!h.object_path(b"3").exists());
}

#[test]
fn test_bookmarks_survive_retention() {
    let mut config = test_config();
    config.storage.max_snapshots = 2;
    let h = RewindTestHarness::with_config(config);

    let ids: Vec<SnapshotId> = (0..5)
        .map(|i| {
            h.write("counter.txt", format!("{i}"));
            h.snapshot("tick")
        })
        .collect();
    h.engine.add_bookmark(&ids[0], "baseline", "known good").unwrap();

    let preview = h.engine.preview_retention().unwrap();
    assert!(preview.dry_run);
    assert_eq!(h.engine.list_snapshots(&SnapshotFilter::default()).unwrap().len(), 5);

    let report = h.engine.enforce_retention().unwrap();
    assert_eq!(report.deleted, preview.candidates.iter().map(|c| c.id.clone()).collect::<Vec<_>>());
    assert!(!report.deleted.contains(&ids[0]));
    assert!(!report.deleted.contains(&ids[4]));

    let bookmarked = h.engine.list_snapshots(&SnapshotFilter::default().bookmarked()).unwrap();
    assert_eq!(bookmarked.len(), 1);
    assert_eq!(bookmarked[0].bookmark.as_ref().unwrap().name, "baseline");
    assert_eq!(
        h.engine
            .get_file_content_lazy(&ids[0], Path::new("counter.txt"))
            .unwrap()
            .as_deref(),
        Some(&b"0"[..])
    );
}

#[test]
fn test_auto_cleanup_after_each_snapshot() {
    let mut config = test_config();
    config.storage.max_snapshots = 2;
    config.storage.auto_cleanup = true;
    let h = RewindTestHarness::with_config(config);

    for i in 0..4 {
        h.write("counter.txt", format!("{i}"));
        h.snapshot("tick");
        assert!(h.engine.list_snapshots(&SnapshotFilter::default()).unwrap().len() <= 2);
    }
}

#[test]
fn test_delete_middle_snapshot_reparents_and_reclaims() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    let s1 = h.snapshot("one");
    h.write("a.txt", "2");
    let s2 = h.snapshot("two");
    h.write("a.txt", "3");
    let s3 = h.snapshot("three");

    // s3 records "2" as the previous content of a.txt, so it stays
    let stats = h.engine.delete_snapshot(&s2).unwrap();
    assert_eq!(stats.blobs_removed, 0);
    assert!(h.object_path(b"2").exists());

    let s3_meta = h.engine.get_snapshot(&s3).unwrap();
    assert_eq!(s3_meta.parent_snapshot.as_deref(), Some(s1.as_str()));
    assert!(matches!(
        h.engine.get_snapshot(&s2),
        Err(RewindError::SnapshotNotFound(_))
    ));
    assert!(matches!(
        h.engine.delete_snapshot(&s2),
        Err(RewindError::SnapshotNotFound(_))
    ));

    let stats = h.engine.delete_snapshot(&s3).unwrap();
    assert_eq!(stats.blobs_removed, 2);
    assert!(!h.object_path(b"2").exists());
    assert!(!h.object_path(b"3").exists());
    assert!(h.object_path(b"1").exists());
    assert_eq!(h.engine.incremental_stats().last_snapshot.as_deref(), Some(s1.as_str()));
}

#[test]
fn test_lazy_content_per_snapshot() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "first");
    let s1 = h.snapshot("one");
    h.write("a.txt", "second");
    let s2 = h.snapshot("two");

    let at_s1 = h.engine.get_file_content_lazy(&s1, Path::new("a.txt")).unwrap().unwrap();
    let at_s2 = h.engine.get_file_content_lazy(&s2, Path::new("a.txt")).unwrap().unwrap();
    assert_eq!(&*at_s1, b"first");
    assert_eq!(&*at_s2, b"second");

    h.engine.get_file_content_lazy(&s1, Path::new("a.txt")).unwrap();
    let stats = h.engine.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 2);

    // Deleting a snapshot drops its cached content
    h.engine.delete_snapshot(&s1).unwrap();
    assert_eq!(h.engine.cache_stats().entries, 1);
}

#[test]
fn test_list_filters() {
    let h = RewindTestHarness::new();
    h.write("src/lib.rs", "fn a() {}");
    let edit = h
        .engine
        .create_snapshot(ActionContext::new("file_edit").with_tag("refactor"))
        .unwrap();
    h.write("README.md", "docs");
    let cmd = h
        .engine
        .create_snapshot(ActionContext::new("bash_command"))
        .unwrap();

    let ids = |filter: SnapshotFilter| -> Vec<SnapshotId> {
        h.engine
            .list_snapshots(&filter)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    };

    assert_eq!(ids(SnapshotFilter::default()), vec![edit.clone(), cmd.clone()]);
    assert_eq!(ids(SnapshotFilter::default().with_action_type("file_edit")), vec![edit.clone()]);
    assert_eq!(ids(SnapshotFilter::default().with_tag("refactor")), vec![edit.clone()]);
    assert_eq!(ids(SnapshotFilter::default().with_file_pattern("*.md")), vec![cmd.clone()]);
    assert_eq!(ids(SnapshotFilter::default().with_file_pattern("src/**")), vec![edit.clone()]);
    assert_eq!(ids(SnapshotFilter::default().with_limit(1)), vec![edit]);
    assert!(ids(SnapshotFilter::default().with_action_type("nope")).is_empty());
}

#[test]
fn test_state_persists_across_reopen() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "a");
    h.write("b.txt", "b");
    let s1 = h.snapshot("before");

    let h = h.reopen();
    h.write("a.txt", "changed");
    let s2 = h.snapshot("after");

    assert_eq!(
        changed_paths(&h.engine.get_file_changes(&s2).unwrap()),
        vec![("a.txt".to_string(), ChangeType::Modified)]
    );
    h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert_eq!(h.read("a.txt").as_deref(), Some("a"));
}

#[test]
fn test_gitignore_and_predicate_filtering() {
    let root_dir = TempDir::new().unwrap();
    let storage_dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new()
        .config(test_config())
        .storage_path(storage_dir.path())
        .background_retention(false)
        .inclusion_predicate(std::sync::Arc::new(|path: &Path| {
            path.extension().map_or(true, |ext| ext != "secret")
        }))
        .build(root_dir.path().to_path_buf())
        .unwrap();

    fs::write(root_dir.path().join(".gitignore"), "*.log\n").unwrap();
    fs::write(root_dir.path().join("keep.txt"), "keep").unwrap();
    fs::write(root_dir.path().join("noise.log"), "noise").unwrap();
    fs::write(root_dir.path().join("token.secret"), "hunter2").unwrap();
    fs::create_dir_all(root_dir.path().join("node_modules/pkg")).unwrap();
    fs::write(root_dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

    let id = engine.create_snapshot(ActionContext::new("scan")).unwrap();
    let paths: Vec<PathBuf> = engine
        .get_snapshot_files(&id)
        .unwrap()
        .into_iter()
        .map(|s| s.path)
        .collect();
    assert_eq!(paths, vec![PathBuf::from(".gitignore"), PathBuf::from("keep.txt")]);
}

#[test]
fn test_generated_project_round_trip() {
    let h = RewindTestHarness::new();
    let files = ProjectGenerator::new(7).populate(&h, 40);
    let original = h.tree();
    let s1 = h.snapshot("generated");

    for path in files.iter().step_by(3) {
        h.write(path, "rewritten");
    }
    for path in files.iter().skip(1).step_by(5) {
        h.remove(path);
    }
    h.write("extra/new.txt", "new");
    h.snapshot("mutated");

    h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert_eq!(h.tree(), original);
    assert!(!h.root().join("extra").exists());
}

#[test]
fn test_referential_integrity_after_mixed_operations() {
    let mut config = test_config();
    config.storage.max_snapshots = 4;
    let h = RewindTestHarness::with_config(config);
    let mut generator = ProjectGenerator::new(99);

    let mut ids = Vec::new();
    for round in 0..8 {
        generator.populate(&h, 5 + round);
        ids.push(h.snapshot("round"));
        if round == 3 {
            h.engine.delete_snapshot(&ids[1]).unwrap();
        }
    }
    h.engine.enforce_retention().unwrap();

    let report = h.engine.validate_integrity().unwrap();
    assert!(report.is_valid(), "{:?}", report);
    assert!(report.orphaned_objects.is_empty());

    let stats = h.engine.storage_stats().unwrap();
    assert_eq!(stats.index.referenced_blob_count, stats.store.object_count);

    for snapshot in h.engine.list_snapshots(&SnapshotFilter::default()).unwrap() {
        for file in h.engine.get_snapshot_files(&snapshot.id).unwrap() {
            assert!(h
                .engine
                .get_file_content_lazy(&snapshot.id, &file.path)
                .unwrap()
                .is_some());
        }
    }
}

#[test]
fn test_orphan_cleanup() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "a");
    h.snapshot("one");

    // A blob nothing references, as left behind by an interrupted snapshot
    let stray = h.object_path(b"stray content");
    fs::create_dir_all(stray.parent().unwrap()).unwrap();
    fs::copy(h.object_path(b"a"), &stray).unwrap();

    let report = h.engine.validate_integrity().unwrap();
    assert_eq!(report.orphaned_objects.len(), 1);

    let dry = h.engine.cleanup_orphans(true).unwrap();
    assert_eq!(dry.unreferenced.len(), 1);
    assert!(stray.exists());

    let gc = h.engine.cleanup_orphans(false).unwrap();
    assert_eq!(gc.blobs_removed, 1);
    assert!(!stray.exists());
    assert!(h.object_path(b"a").exists());
}
