//! Main test module for rewind
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for resilience against damaged storage and races
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::rewind::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::integration::RewindTestHarness;

    #[test]
    fn test_empty_directory() {
        let h = RewindTestHarness::new();

        let empty = h.snapshot("empty");
        let metadata = h.engine.get_snapshot(&empty).unwrap();
        assert_eq!(metadata.total_size, 0);
        assert!(h.engine.get_snapshot_files(&empty).unwrap().is_empty());

        h.write("file.txt", "content");
        h.write("nested/deeper/file.txt", "content");

        // Rolling back removes the files and the directories they left empty
        h.engine
            .execute_rollback(&empty, &RollbackOptions::default())
            .unwrap();
        assert!(h.tree().is_empty());
        assert!(!h.root().join("nested").exists());
    }

    #[test]
    fn test_special_filenames() {
        let h = RewindTestHarness::new();
        let special_names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "file{with}braces.txt",
        ];

        let mut created = Vec::new();
        for name in special_names {
            if fs::write(h.root().join(name), format!("Content of {}", name)).is_ok() {
                created.push(name);
            }
        }

        let id = h.snapshot("special");
        for name in &created {
            h.remove(name);
        }
        h.engine.execute_rollback(&id, &RollbackOptions::default()).unwrap();

        for name in &created {
            assert_eq!(h.read(name), Some(format!("Content of {}", name)));
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let h = RewindTestHarness::new();
        let unicode_names = [
            "файл.txt",
            "文件.txt",
            "ファイル.txt",
            "αρχείο.txt",
            "🚀🌟💾.txt",
        ];

        let mut created = Vec::new();
        for name in unicode_names {
            if fs::write(h.root().join(name), format!("Unicode content: {}", name)).is_ok() {
                created.push(name);
            }
        }
        if created.is_empty() {
            return;
        }

        let id = h.snapshot("unicode");
        for name in &created {
            h.remove(name);
        }
        h.engine.execute_rollback(&id, &RollbackOptions::default()).unwrap();

        for name in &created {
            assert_eq!(h.read(name), Some(format!("Unicode content: {}", name)));
            let lazy = h.engine.get_file_content_lazy(&id, Path::new(name)).unwrap();
            assert!(lazy.is_some());
        }
    }

    #[test]
    fn test_empty_and_binary_files() {
        let h = RewindTestHarness::new();
        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        h.write("empty.txt", "");
        h.write("blob.bin", &binary);

        let id = h.snapshot("mixed");
        h.write("empty.txt", "no longer empty");
        h.write("blob.bin", b"\x00\x01");

        h.engine.execute_rollback(&id, &RollbackOptions::default()).unwrap();
        assert_eq!(fs::read(h.root().join("empty.txt")).unwrap(), b"");
        assert_eq!(fs::read(h.root().join("blob.bin")).unwrap(), binary);

        let files = h.engine.get_snapshot_files(&id).unwrap();
        let empty = files.iter().find(|f| f.path == Path::new("empty.txt")).unwrap();
        assert_eq!(empty.size, 0);
        assert_eq!(empty.content_hash, utils::hash_data(b""));
    }

    #[test]
    fn test_deeply_nested_paths() {
        let h = RewindTestHarness::new();
        let deep: String = (0..30).map(|i| format!("level{i}/")).collect::<String>() + "leaf.txt";
        h.write(&deep, "bottom");

        let id = h.snapshot("deep");
        fs::remove_dir_all(h.root().join("level0")).unwrap();

        h.engine.execute_rollback(&id, &RollbackOptions::default()).unwrap();
        assert_eq!(h.read(&deep).as_deref(), Some("bottom"));
    }

    #[test]
    fn test_file_replaced_by_directory_of_same_name() {
        let h = RewindTestHarness::new();
        h.write("thing", "a file");
        let s1 = h.snapshot("file");

        h.remove("thing");
        h.write("thing/child.txt", "a directory now");
        let s2 = h.snapshot("directory");

        let changes = h.engine.get_file_changes(&s2).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|c| c.file_path == Path::new("thing") && c.change_type == ChangeType::Deleted));
        assert!(changes.iter().any(|c| c.file_path == Path::new("thing/child.txt")
            && c.change_type == ChangeType::Added));

        let result = h.engine.execute_rollback(&s1, &RollbackOptions::default()).unwrap();
        assert_eq!(result.files_restored, vec![PathBuf::from("thing")]);
        assert_eq!(result.files_deleted, vec![PathBuf::from("thing/child.txt")]);
        assert_eq!(h.read("thing").as_deref(), Some("a file"));

        // And forward again: the file gives way to the directory
        h.engine.execute_rollback(&s2, &RollbackOptions::default()).unwrap();
        assert_eq!(h.read("thing/child.txt").as_deref(), Some("a directory now"));
        assert!(h.root().join("thing").is_dir());
    }

    #[test]
    fn test_selective_path_escaping_root_is_rejected() {
        let h = RewindTestHarness::new();
        h.write("a.txt", "a");
        let id = h.snapshot("capture");

        for path in ["../outside.txt", "/etc/passwd"] {
            let options = RollbackOptions::selective(vec![PathBuf::from(path)]);
            assert!(matches!(
                h.engine.preview_rollback(&id, &options),
                Err(RewindError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_identical_content_under_many_names() {
        let h = RewindTestHarness::new();
        for i in 0..50 {
            h.write(&format!("copies/copy{i}.txt"), "same bytes everywhere");
        }
        h.snapshot("copies");

        let stats = h.engine.storage_stats().unwrap();
        assert_eq!(stats.store.object_count, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_restored() {
        use std::os::unix::fs::PermissionsExt;

        let h = RewindTestHarness::new();
        h.write("run.sh", "#!/bin/sh\necho hi\n");
        fs::set_permissions(h.root().join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        let id = h.snapshot("script");

        h.remove("run.sh");
        h.engine.execute_rollback(&id, &RollbackOptions::default()).unwrap();

        let mode = fs::metadata(h.root().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_captured() {
        let h = RewindTestHarness::new();
        h.write("target.txt", "real");
        std::os::unix::fs::symlink(h.root().join("target.txt"), h.root().join("link.txt")).unwrap();

        let id = h.snapshot("links");
        let paths: Vec<PathBuf> = h
            .engine
            .get_snapshot_files(&id)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec![PathBuf::from("target.txt")]);
    }
}
