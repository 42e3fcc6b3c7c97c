//! Chaos tests for rewind
//!
//! Damages the blob store, races retention against snapshot creation and
//! swaps files and directories under the rollback engine, checking that every
//! failure leaves the working tree and the index consistent.

use ::rewind::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::integration::{test_config, RewindTestHarness};

/// Overwrite a stored blob with random bytes
fn corrupt_blob(path: &Path, rng: &mut StdRng) {
    let len = fs::metadata(path).unwrap().len().max(8) as usize;
    let garbage: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    fs::write(path, garbage).unwrap();
}

/// Flip one byte inside a stored blob
fn flip_byte(path: &Path) {
    let mut bytes = fs::read(path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(path, bytes).unwrap();
}

#[test]
fn test_corrupted_blob_is_detected_everywhere() {
    let h = RewindTestHarness::new();
    h.write("good.txt", "fine");
    h.write("bad.txt", "this blob will be damaged");
    let s1 = h.snapshot("before");
    h.write("bad.txt", "current");
    h.snapshot("after");

    let mut rng = StdRng::seed_from_u64(42);
    corrupt_blob(&h.object_path(b"this blob will be damaged"), &mut rng);

    let report = h.engine.validate_integrity().unwrap();
    assert!(!report.is_valid());
    assert_eq!(
        report.corrupted_objects,
        vec![utils::hash_data(b"this blob will be damaged")]
    );

    assert!(matches!(
        h.engine.get_file_content_lazy(&s1, Path::new("bad.txt")),
        Err(RewindError::StoreCorruption { .. })
    ));
    assert_eq!(
        h.engine
            .get_file_content_lazy(&s1, Path::new("good.txt"))
            .unwrap()
            .as_deref(),
        Some(&b"fine"[..])
    );

    // Rollback verifies every blob before touching the tree
    let before = h.tree();
    let result = h.engine.execute_rollback(&s1, &RollbackOptions::default());
    assert!(matches!(result, Err(RewindError::StoreCorruption { .. })));
    assert_eq!(h.tree(), before);
}

#[test]
fn test_single_bit_damage_is_detected() {
    let h = RewindTestHarness::new();
    let content = "x".repeat(10_000);
    h.write("big.txt", &content);
    let s1 = h.snapshot("capture");

    flip_byte(&h.object_path(content.as_bytes()));

    assert!(h.engine.get_file_content_lazy(&s1, Path::new("big.txt")).is_err());
    assert!(!h.engine.validate_integrity().unwrap().is_valid());
}

#[test]
fn test_missing_blob_is_reported() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "vanishing");
    let s1 = h.snapshot("capture");
    h.write("a.txt", "changed");
    h.snapshot("after");

    fs::remove_file(h.object_path(b"vanishing")).unwrap();

    let report = h.engine.validate_integrity().unwrap();
    assert_eq!(report.missing_objects, vec![utils::hash_data(b"vanishing")]);
    assert!(matches!(
        h.engine.get_file_content_lazy(&s1, Path::new("a.txt")),
        Err(RewindError::ObjectNotFound(_))
    ));

    let result = h.engine.execute_rollback(&s1, &RollbackOptions::default());
    assert!(matches!(result, Err(RewindError::ObjectNotFound(_))));
    assert_eq!(h.read("a.txt").as_deref(), Some("changed"));
}

#[test]
fn test_type_swaps_round_trip_without_leftovers() {
    let h = RewindTestHarness::new();
    h.write("a.txt", "1");
    h.write("sub", "a file called sub");
    h.write("nest/deep/file.txt", "deep");
    let s1 = h.snapshot("files");
    let original = h.tree();

    // Every entry changes type
    h.write("a.txt", "2");
    h.remove("sub");
    h.write("sub/inner.txt", "inside");
    fs::remove_dir_all(h.root().join("nest")).unwrap();
    h.write("nest", "flattened");
    let s2 = h.snapshot("swapped");
    let swapped = h.tree();

    let options = RollbackOptions::selective(vec![PathBuf::from("a.txt"), PathBuf::from("sub")]);
    h.engine.execute_rollback(&s1, &options).unwrap();
    assert_eq!(h.read("a.txt").as_deref(), Some("1"));
    assert_eq!(h.read("sub").as_deref(), Some("a file called sub"));
    assert_eq!(h.read("nest").as_deref(), Some("flattened"));

    h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
    assert_eq!(h.tree(), original);
    h.engine.execute_rollback(&s2, &RollbackOptions::default()).unwrap();
    assert_eq!(h.tree(), swapped);

    let staging_leftovers = walkdir::WalkDir::new(h.root())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(".rewind-tmp-")
        })
        .count();
    assert_eq!(staging_leftovers, 0);
    assert!(h.engine.validate_integrity().unwrap().is_valid());
}

#[test]
fn test_concurrent_retention_and_creation() {
    let mut config = test_config();
    config.storage.max_snapshots = 3;
    let h = RewindTestHarness::with_config(config);
    let engine = Arc::new(h.engine);
    let root = h.root_dir.path().to_path_buf();
    let done = Arc::new(AtomicBool::new(false));

    let cleaner = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut runs = 0;
            while !done.load(Ordering::Acquire) {
                engine.enforce_retention().unwrap();
                runs += 1;
            }
            runs
        })
    };

    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..25 {
        for i in 0..4 {
            let content: Vec<u8> = (0..rng.random_range(1..512)).map(|_| rng.random()).collect();
            fs::write(root.join(format!("f{i}.bin")), content).unwrap();
        }
        // Recurs every third round
        fs::write(root.join("shared.txt"), format!("shared {}", round % 3)).unwrap();
        engine.create_snapshot(ActionContext::new("round")).unwrap();
    }
    done.store(true, Ordering::Release);
    let runs = cleaner.join().unwrap();
    assert!(runs > 0);

    engine.enforce_retention().unwrap();
    let snapshots = engine.list_snapshots(&SnapshotFilter::default()).unwrap();
    assert_eq!(snapshots.len(), 3);

    let report = engine.validate_integrity().unwrap();
    assert!(report.is_valid(), "{:?}", report);
    assert!(report.orphaned_objects.is_empty());
    for snapshot in &snapshots {
        for file in engine.get_snapshot_files(&snapshot.id).unwrap() {
            assert!(engine.get_file_content_lazy(&snapshot.id, &file.path).is_ok());
        }
    }
}

#[test]
fn test_parallel_readers_during_writes() {
    let h = RewindTestHarness::new();
    for i in 0..20 {
        h.write(&format!("file{i}.txt"), format!("initial {i}"));
    }
    let base = h.snapshot("base");
    let engine = Arc::new(h.engine);
    let root = h.root_dir.path().to_path_buf();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let base = base.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    let path = PathBuf::from(format!("file{}.txt", round % 20));
                    let content = engine.get_file_content_lazy(&base, &path).unwrap().unwrap();
                    assert_eq!(&*content, format!("initial {}", round % 20).as_bytes());
                }
            })
        })
        .collect();

    for round in 0..5 {
        fs::write(root.join("file0.txt"), format!("round {round}")).unwrap();
        engine.create_snapshot(ActionContext::new("write")).unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(engine.cache_stats().hits > 0);
}

#[test]
fn test_files_vanishing_between_snapshots() {
    let h = RewindTestHarness::new();
    let mut rng = StdRng::seed_from_u64(1234);
    let mut present: Vec<String> = Vec::new();

    for round in 0..10 {
        for _ in 0..5 {
            let name = format!("dir{}/f{}.txt", rng.random_range(0..3), rng.random_range(0..20));
            h.write(&name, format!("{round}"));
            present.push(name);
        }
        present.sort();
        present.dedup();
        for _ in 0..2 {
            if present.is_empty() {
                break;
            }
            let victim = present.remove(rng.random_range(0..present.len()));
            h.remove(&victim);
        }
        h.snapshot("churn");
    }

    let latest = h.engine.latest_snapshot().unwrap().unwrap();
    let captured: Vec<PathBuf> = h
        .engine
        .get_snapshot_files(&latest.id)
        .unwrap()
        .into_iter()
        .map(|s| s.path)
        .collect();
    let mut expected: Vec<PathBuf> = present.iter().map(PathBuf::from).collect();
    expected.sort();
    assert_eq!(captured, expected);
    assert!(h.engine.validate_integrity().unwrap().is_valid());
}
