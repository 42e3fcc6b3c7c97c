//! Property-based tests for rewind
//!
//! Uses proptest to check invariants over randomly generated file trees and
//! operation sequences.

use ::rewind::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::integration::RewindTestHarness;

/// One mutation applied to the working tree
#[derive(Debug, Clone)]
pub enum FileOperation {
    Write { path: String, content: Vec<u8> },
    Delete { index: usize },
}

fn path_strategy() -> impl Strategy<Value = String> {
    let dirs = prop::collection::vec("[a-z]{1,6}", 0..=2);
    let name = prop_oneof!["file[0-9]{1,2}\\.txt", "[a-z]{3,8}\\.(rs|md)"];
    (dirs, name).prop_map(|(dirs, name)| {
        let mut parts = dirs;
        // Keep directory components from colliding with file names
        for part in &mut parts {
            part.insert_str(0, "d_");
        }
        parts.push(name);
        parts.join("/")
    })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..256),
        "[a-z \\n]{0,200}".prop_map(|s| s.into_bytes()),
        // Highly compressible
        (1usize..4096).prop_map(|n| vec![b'x'; n]),
    ]
}

fn operation_strategy() -> impl Strategy<Value = FileOperation> {
    prop_oneof![
        3 => (path_strategy(), content_strategy())
            .prop_map(|(path, content)| FileOperation::Write { path, content }),
        1 => any::<usize>().prop_map(|index| FileOperation::Delete { index }),
    ]
}

fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..12)
}

fn apply(harness: &RewindTestHarness, op: &FileOperation) {
    match op {
        FileOperation::Write { path, content } => harness.write(path, content),
        FileOperation::Delete { index } => {
            let files: Vec<PathBuf> = harness.tree().into_keys().collect();
            if !files.is_empty() {
                let victim = &files[index % files.len()];
                std::fs::remove_file(harness.root().join(victim)).unwrap();
            }
        }
    }
}

fn as_tree(files: &BTreeMap<String, Vec<u8>>) -> BTreeMap<PathBuf, Vec<u8>> {
    files
        .iter()
        .map(|(path, content)| (PathBuf::from(path), content.clone()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Rolling back to any snapshot reproduces its tree exactly
    #[test]
    fn prop_rollback_restores_snapshot(
        initial in tree_strategy(),
        ops in prop::collection::vec(operation_strategy(), 1..12),
    ) {
        let h = RewindTestHarness::new();
        for (path, content) in &initial {
            h.write(path, content);
        }
        let s1 = h.snapshot("initial");
        let expected = h.tree();
        prop_assert_eq!(&expected, &as_tree(&initial));

        for op in &ops {
            apply(&h, op);
        }
        h.snapshot("mutated");

        h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
        prop_assert_eq!(h.tree(), expected);
    }

    /// Recorded changes replayed over the parent manifest give the child manifest
    #[test]
    fn prop_changes_connect_manifests(
        initial in tree_strategy(),
        ops in prop::collection::vec(operation_strategy(), 0..10),
    ) {
        let h = RewindTestHarness::new();
        for (path, content) in &initial {
            h.write(path, content);
        }
        let s1 = h.snapshot("before");
        for op in &ops {
            apply(&h, op);
        }
        let s2 = h.snapshot("after");

        let mut replayed: BTreeMap<PathBuf, String> = h
            .engine
            .get_snapshot_files(&s1)
            .unwrap()
            .into_iter()
            .map(|s| (s.path, s.content_hash))
            .collect();
        for change in h.engine.get_file_changes(&s2).unwrap() {
            match change.change_type {
                ChangeType::Added | ChangeType::Modified => {
                    replayed.insert(change.file_path, change.content_hash.unwrap());
                }
                ChangeType::Deleted => {
                    prop_assert!(replayed.remove(&change.file_path).is_some());
                }
            }
        }

        let actual: BTreeMap<PathBuf, String> = h
            .engine
            .get_snapshot_files(&s2)
            .unwrap()
            .into_iter()
            .map(|s| (s.path, s.content_hash))
            .collect();
        prop_assert_eq!(replayed, actual);
    }

    /// A cold signature cache yields the same manifest as a warm one
    #[test]
    fn prop_cold_cache_matches_warm(
        initial in tree_strategy(),
        ops in prop::collection::vec(operation_strategy(), 0..8),
    ) {
        let h = RewindTestHarness::new();
        for (path, content) in &initial {
            h.write(path, content);
        }
        h.snapshot("seed");
        for op in &ops {
            apply(&h, op);
        }

        let warm = h.snapshot("warm");
        h.engine.clear_caches();
        let cold = h.snapshot("cold");

        prop_assert_eq!(
            h.engine.get_snapshot_files(&warm).unwrap(),
            h.engine.get_snapshot_files(&cold).unwrap()
        );
        prop_assert!(h.engine.get_file_changes(&cold).unwrap().is_empty());
    }

    /// Lazy reads return exactly the bytes that were captured
    #[test]
    fn prop_lazy_content_matches_capture(files in tree_strategy()) {
        let h = RewindTestHarness::new();
        for (path, content) in &files {
            h.write(path, content);
        }
        let id = h.snapshot("capture");

        for (path, content) in &files {
            let loaded = h.engine.get_file_content_lazy(&id, Path::new(path)).unwrap();
            prop_assert_eq!(loaded.as_deref(), Some(content.as_slice()));
        }
    }

    /// Retention never drops the newest or a bookmarked snapshot, never exceeds
    /// the count limit, and leaves every remaining manifest readable
    #[test]
    fn prop_retention_invariants(
        rounds in 2usize..9,
        max_snapshots in 1usize..4,
        bookmark_at in any::<prop::sample::Index>(),
    ) {
        let mut config = crate::integration::test_config();
        config.storage.max_snapshots = max_snapshots;
        let h = RewindTestHarness::with_config(config);

        let ids: Vec<SnapshotId> = (0..rounds)
            .map(|i| {
                h.write(&format!("f{}.txt", i % 3), format!("round {i}"));
                h.snapshot("round")
            })
            .collect();
        let bookmarked = ids[bookmark_at.index(ids.len())].clone();
        h.engine.add_bookmark(&bookmarked, "keep", "").unwrap();

        h.engine.enforce_retention().unwrap();
        let remaining: Vec<SnapshotId> = h
            .engine
            .list_snapshots(&SnapshotFilter::default())
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();

        prop_assert!(remaining.contains(ids.last().unwrap()));
        prop_assert!(remaining.contains(&bookmarked));
        prop_assert!(remaining.len() <= max_snapshots.max(2));

        let report = h.engine.validate_integrity().unwrap();
        prop_assert!(report.is_valid());
        prop_assert!(report.orphaned_objects.is_empty());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Identical bytes map to one blob regardless of path
    #[test]
    fn prop_store_deduplicates(content in content_strategy(), copies in 1usize..5) {
        let h = RewindTestHarness::new();
        for i in 0..copies {
            h.write(&format!("copy_{i}.bin"), &content);
        }
        h.snapshot("dedup");
        prop_assert_eq!(h.engine.storage_stats().unwrap().store.object_count, 1);
    }

    /// Snapshot ids sort in creation order
    #[test]
    fn prop_ids_are_ordered(count in 1usize..8) {
        let h = RewindTestHarness::new();
        h.write("a.txt", "a");
        let ids: Vec<SnapshotId> = (0..count).map(|_| h.snapshot("tick")).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        prop_assert_eq!(ids, sorted);
    }

    /// The inclusion predicate is applied to every captured path
    #[test]
    fn prop_predicate_filters_paths(files in tree_strategy()) {
        let root_dir = tempfile::TempDir::new().unwrap();
        let storage_dir = tempfile::TempDir::new().unwrap();
        let engine = EngineBuilder::new()
            .config(crate::integration::test_config())
            .storage_path(storage_dir.path())
            .background_retention(false)
            .inclusion_predicate(Arc::new(|path: &Path| {
                path.extension().map_or(false, |ext| ext == "rs")
            }))
            .build(root_dir.path().to_path_buf())
            .unwrap();
        for (path, content) in &files {
            let full = root_dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }

        let id = engine.create_snapshot(ActionContext::new("filter")).unwrap();
        let captured: Vec<PathBuf> = engine
            .get_snapshot_files(&id)
            .unwrap()
            .into_iter()
            .map(|s| s.path)
            .collect();
        let mut expected: Vec<PathBuf> = files
            .keys()
            .filter(|p| p.ends_with(".rs"))
            .map(PathBuf::from)
            .collect();
        expected.sort();
        prop_assert_eq!(captured, expected);
    }
}
