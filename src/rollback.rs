//! Rollback planning and application
//!
//! A rollback compares three states of every path in scope:
//!
//! - the **target** snapshot being restored
//! - the **current** working tree, as scanned just before planning
//! - the **baseline**, the latest captured snapshot before the rollback began
//!
//! Paths whose current content differs from the target are restored, and for
//! full rollbacks, paths that did not exist at the target are deleted. When
//! current content also differs from the baseline, the file was edited outside
//! of any capture and the path is reported as a [`FileConflict`].
//!
//! ## Application
//!
//! [`RollbackEngine::execute`] never leaves the tree half-restored:
//!
//! 1. every needed blob is loaded and verified before anything is touched
//! 2. originals of all affected entries are copied to `backups/<rollback id>/`,
//!    whole directories included when one stands where a file must go
//! 3. deletions are applied and entries blocking a restored path are cleared
//! 4. new content is staged in temp files beside each destination, then
//!    renamed into place
//!
//! If steps 3 or 4 fail part way, everything already applied is undone from
//! the backup, newest first, and [`RewindError::RollbackFailed`] is returned.

use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use crate::collections::{HashMap, HashSet, HashSetExt};
use crate::error::{Result, RewindError};
use crate::index::MetadataIndex;
use crate::storage::ContentStore;
use crate::types::{
    ConflictKind, FileConflict, FileState, RollbackOptions, RollbackPreview, RollbackResult,
};
use crate::utils::{normalize_relative, remove_dir_if_empty, remove_empty_parents, set_permissions};

/// Name of the backup directory inside the storage directory
pub const BACKUP_DIR_NAME: &str = "backups";

const STAGING_PREFIX: &str = ".rewind-tmp-";

/// Plans and applies rollbacks for one project root
pub struct RollbackEngine {
    root: PathBuf,
    backup_root: PathBuf,
    store: Arc<ContentStore>,
    index: Arc<MetadataIndex>,
}

impl std::fmt::Debug for RollbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackEngine")
            .field("root", &self.root)
            .field("backup_root", &self.backup_root)
            .finish()
    }
}

struct Staged {
    path: PathBuf,
    temp: NamedTempFile,
}

/// Originals copied aside before the tree is touched
struct Backup {
    dir: PathBuf,
    files: HashSet<PathBuf>,
    trees: HashSet<PathBuf>,
}

impl Backup {
    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.trees.is_empty()
    }
}

enum Applied {
    Deleted { path: PathBuf },
    /// An entry removed so a restored file could take its place
    Cleared { path: PathBuf, was_dir: bool },
    CreatedDir { path: PathBuf },
    Wrote { path: PathBuf, had_original: bool },
}

impl Applied {
    fn path(&self) -> &Path {
        match self {
            Applied::Deleted { path }
            | Applied::Cleared { path, .. }
            | Applied::CreatedDir { path }
            | Applied::Wrote { path, .. } => path,
        }
    }
}

/// Payloads to write: path, verified content and permission bits
type Payloads = Vec<(PathBuf, Vec<u8>, u32)>;

impl RollbackEngine {
    /// Create a rollback engine writing backups under `storage_dir/backups`
    pub fn new(
        root: PathBuf,
        storage_dir: &Path,
        store: Arc<ContentStore>,
        index: Arc<MetadataIndex>,
    ) -> Self {
        Self {
            root,
            backup_root: storage_dir.join(BACKUP_DIR_NAME),
            store,
            index,
        }
    }

    /// Compute what a rollback to `target_id` would do
    ///
    /// `current` is the scanned state of the working tree and conflicts are
    /// judged against the latest snapshot in the index. Nothing is modified.
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] for an unknown target
    /// - [`RewindError::InvalidPath`] if a selective path is absolute or
    ///   escapes the root
    pub fn preview(
        &self,
        target_id: &str,
        current: &HashMap<PathBuf, FileState>,
        options: &RollbackOptions,
    ) -> Result<RollbackPreview> {
        let baseline_id = self.index.latest_snapshot()?.map(|s| s.id);
        self.preview_against(target_id, baseline_id.as_deref(), current, options)
    }

    /// Like [`RollbackEngine::preview`], judging conflicts against `baseline_id`
    #[instrument(skip(self, current, options))]
    pub fn preview_against(
        &self,
        target_id: &str,
        baseline_id: Option<&str>,
        current: &HashMap<PathBuf, FileState>,
        options: &RollbackOptions,
    ) -> Result<RollbackPreview> {
        let target = self.manifest(target_id)?;

        let baseline = match baseline_id {
            Some(id) if id == target_id => None,
            Some(id) => Some(self.manifest(id)?),
            None => None,
        };
        let baseline = baseline.as_ref().unwrap_or(&target);

        let scope: Option<HashSet<PathBuf>> = if options.is_full() {
            None
        } else {
            let mut scope = HashSet::with_capacity(options.selective_files.len());
            for path in &options.selective_files {
                scope.insert(normalize_relative(path)?);
            }
            Some(scope)
        };
        let in_scope = |path: &Path| scope.as_ref().map_or(true, |s| s.contains(path));

        let mut to_restore = Vec::new();
        let mut bytes_to_write = 0;
        for (path, state) in &target {
            if !in_scope(path.as_path()) {
                continue;
            }
            let differs = current
                .get(path)
                .map_or(true, |c| c.content_hash != state.content_hash);
            if differs {
                to_restore.push(path.clone());
                bytes_to_write += state.size;
            }
        }

        let mut to_delete = Vec::new();
        if options.is_full() {
            to_delete.extend(current.keys().filter(|p| !target.contains_key(*p)).cloned());
        }

        to_restore.sort();
        to_delete.sort();

        let mut conflicts = Vec::new();
        for path in to_restore.iter().chain(to_delete.iter()) {
            let current_hash = current.get(path).map(|s| s.content_hash.clone());
            let captured_hash = baseline.get(path).map(|s| s.content_hash.clone());
            if current_hash == captured_hash {
                continue;
            }
            let kind = match (&captured_hash, &current_hash) {
                (Some(_), Some(_)) => ConflictKind::ModifiedSinceCapture,
                (None, _) => ConflictKind::CreatedSinceCapture,
                (Some(_), None) => ConflictKind::DeletedSinceCapture,
            };
            conflicts.push(FileConflict {
                path: path.clone(),
                kind,
                current_hash,
                target_hash: target.get(path).map(|s| s.content_hash.clone()),
                captured_hash,
            });
        }
        conflicts.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            "Rollback plan for {}: {} to restore, {} to delete, {} conflicts",
            target_id,
            to_restore.len(),
            to_delete.len(),
            conflicts.len()
        );

        Ok(RollbackPreview {
            target_id: target_id.to_string(),
            baseline_id: baseline_id.map(str::to_string),
            to_restore,
            to_delete,
            conflicts,
            bytes_to_write,
        })
    }

    /// Restore the working tree to `target_id`
    ///
    /// Conflicts are judged against the latest snapshot in the index.
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] for an unknown target
    /// - [`RewindError::StoreCorruption`] or [`RewindError::ObjectNotFound`]
    ///   if a needed blob is unusable; the tree is untouched
    /// - [`RewindError::RollbackFailed`] if applying failed; applied changes
    ///   were undone
    pub fn execute(
        &self,
        target_id: &str,
        current: &HashMap<PathBuf, FileState>,
        options: &RollbackOptions,
    ) -> Result<RollbackResult> {
        let baseline_id = self.index.latest_snapshot()?.map(|s| s.id);
        self.execute_against(target_id, baseline_id.as_deref(), current, options)
    }

    /// Like [`RollbackEngine::execute`], judging conflicts against `baseline_id`
    #[instrument(skip(self, current, options))]
    pub fn execute_against(
        &self,
        target_id: &str,
        baseline_id: Option<&str>,
        current: &HashMap<PathBuf, FileState>,
        options: &RollbackOptions,
    ) -> Result<RollbackResult> {
        let start = Instant::now();
        let preview = self.preview_against(target_id, baseline_id, current, options)?;
        let mut result = RollbackResult::empty(target_id.to_string(), options.dry_run);

        let mut preserved: HashSet<PathBuf> = HashSet::new();
        for conflict in preview.conflicts {
            if options.preserve_manual_changes {
                preserved.insert(conflict.path.clone());
                result.conflicts_preserved.push(conflict);
            } else {
                result.conflicts_overwritten.push(conflict);
            }
        }

        let mut restore: Vec<PathBuf> = preview
            .to_restore
            .into_iter()
            .filter(|p| !preserved.contains(p))
            .collect();
        let delete: Vec<PathBuf> = preview
            .to_delete
            .into_iter()
            .filter(|p| !preserved.contains(p))
            .collect();

        // Entries standing where a restored file must go
        let mut clear: Vec<PathBuf> = Vec::new();
        let mut blocked: HashSet<PathBuf> = HashSet::new();
        for path in &restore {
            let Some(obstacle) = self.obstacle(path)? else {
                continue;
            };
            if preserved.iter().any(|p| p.starts_with(&obstacle)) {
                result.warnings.push(format!(
                    "{} not restored: {} holds preserved changes",
                    path.display(),
                    obstacle.display()
                ));
                blocked.insert(path.clone());
            } else if !delete.contains(&obstacle) && !clear.contains(&obstacle) {
                clear.push(obstacle);
            }
        }
        restore.retain(|p| !blocked.contains(p));

        if options.dry_run || (restore.is_empty() && delete.is_empty()) {
            result.files_restored = restore;
            result.files_deleted = delete;
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        // Load and verify everything before touching the tree
        let target = self.manifest(target_id)?;
        let mut payloads: Payloads = Vec::with_capacity(restore.len());
        for path in &restore {
            let state = target
                .get(path)
                .ok_or_else(|| RewindError::internal(format!("{} missing from target", path.display())))?;
            let content = self.store.get(&state.content_hash)?;
            payloads.push((path.clone(), content, state.permissions));
        }

        let rollback_id = uuid::Uuid::new_v4().simple().to_string();
        let backup_dir = self.backup_root.join(&rollback_id);

        let affected: BTreeSet<&PathBuf> = restore.iter().chain(&delete).chain(&clear).collect();
        let backup = match self.back_up(&backup_dir, affected) {
            Ok(backup) => backup,
            Err(e) => {
                discard_backup(&backup_dir);
                return Err(RewindError::RollbackFailed(format!("backup failed: {}", e)));
            }
        };

        let mut applied = Vec::with_capacity(restore.len() + delete.len() + clear.len());
        if let Err(e) = self.apply(&payloads, &delete, &clear, &backup, &mut applied) {
            let undo_errors = self.undo(&applied, &backup);
            let message = if undo_errors.is_empty() {
                discard_backup(&backup_dir);
                format!("{}; {} applied changes undone", e, applied.len())
            } else {
                format!(
                    "{}; undo incomplete ({}), originals kept in {}",
                    e,
                    undo_errors.join("; "),
                    backup_dir.display()
                )
            };
            warn!("Rollback to {} failed: {}", target_id, message);
            return Err(RewindError::RollbackFailed(message));
        }

        if options.create_backup && !backup.is_empty() {
            result.backup_path = Some(backup_dir);
        } else {
            discard_backup(&backup_dir);
        }

        result.bytes_written = payloads.iter().map(|(_, content, _)| content.len() as u64).sum();
        result.files_restored = restore;
        result.files_deleted = delete;
        result.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Rolled back to {}: {} restored, {} deleted, {} cleared, {} conflicts preserved",
            target_id,
            result.files_restored.len(),
            result.files_deleted.len(),
            clear.len(),
            result.conflicts_preserved.len()
        );
        Ok(result)
    }

    fn manifest(&self, id: &str) -> Result<HashMap<PathBuf, FileState>> {
        Ok(self
            .index
            .file_states(id)?
            .into_iter()
            .map(|s| (s.path.clone(), s))
            .collect())
    }

    /// Metadata of `path` under the root, `None` if it does not exist
    ///
    /// A path below a regular file does not exist either.
    fn stat(&self, path: &Path) -> Result<Option<fs::Metadata>> {
        match fs::symlink_metadata(self.root.join(path)) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                for ancestor in path.ancestors().skip(1) {
                    if ancestor.as_os_str().is_empty() {
                        break;
                    }
                    match fs::symlink_metadata(self.root.join(ancestor)) {
                        Ok(meta) if !meta.is_dir() => return Ok(None),
                        _ => {}
                    }
                }
                Err(e.into())
            }
        }
    }

    /// The entry that keeps `path` from being written as a regular file
    ///
    /// That is the first ancestor that is not a directory, or `path` itself
    /// when it is a directory.
    fn obstacle(&self, path: &Path) -> Result<Option<PathBuf>> {
        let mut prefix = PathBuf::new();
        let mut components = path.components().peekable();
        while let Some(component) = components.next() {
            prefix.push(component);
            let last = components.peek().is_none();
            match fs::symlink_metadata(self.root.join(&prefix)) {
                Ok(meta) if last => return Ok(meta.is_dir().then_some(prefix)),
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Ok(Some(prefix)),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Copy every existing file or directory among `paths` into `backup_dir`
    fn back_up<'a, I>(&self, backup_dir: &Path, paths: I) -> Result<Backup>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut backup = Backup {
            dir: backup_dir.to_path_buf(),
            files: HashSet::new(),
            trees: HashSet::new(),
        };
        for path in paths {
            let Some(meta) = self.stat(path)? else {
                continue;
            };
            let destination = backup_dir.join(path);
            if meta.is_dir() {
                copy_tree(&self.root.join(path), &destination)?;
                backup.trees.insert(path.clone());
            } else if meta.is_file() {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(self.root.join(path), &destination)?;
                backup.files.insert(path.clone());
            } else {
                continue;
            }
            trace!("Backed up {}", path.display());
        }
        Ok(backup)
    }

    /// Apply deletions, clear obstacles, then stage and persist every payload
    ///
    /// Each change is pushed to `applied` so a failure can be undone.
    fn apply(
        &self,
        payloads: &[(PathBuf, Vec<u8>, u32)],
        delete: &[PathBuf],
        clear: &[PathBuf],
        backup: &Backup,
        applied: &mut Vec<Applied>,
    ) -> Result<()> {
        for path in delete {
            let destination = self.root.join(path);
            match fs::remove_file(&destination) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            applied.push(Applied::Deleted { path: path.clone() });
            if let Err(e) = remove_empty_parents(&destination, &self.root) {
                debug!("Leaving parent of {}: {}", path.display(), e);
            }
            trace!("Deleted {}", path.display());
        }

        for path in clear {
            // Deletions may already have emptied and removed it
            let Some(meta) = self.stat(path)? else {
                continue;
            };
            let was_dir = meta.is_dir();
            applied.push(Applied::Cleared {
                path: path.clone(),
                was_dir,
            });
            let destination = self.root.join(path);
            if was_dir {
                fs::remove_dir_all(&destination)?;
            } else {
                fs::remove_file(&destination)?;
            }
            trace!("Cleared {}", path.display());
        }

        let staged = self.stage(payloads, applied)?;
        for Staged { path, temp } in staged {
            let destination = self.root.join(&path);
            temp.persist(&destination).map_err(|e| RewindError::from(e.error))?;
            trace!("Restored {}", path.display());
            applied.push(Applied::Wrote {
                had_original: backup.files.contains(&path),
                path,
            });
        }
        Ok(())
    }

    /// Write each payload to a temp file in its destination directory
    ///
    /// Directories created on the way are pushed to `applied`.
    fn stage(
        &self,
        payloads: &[(PathBuf, Vec<u8>, u32)],
        applied: &mut Vec<Applied>,
    ) -> Result<Vec<Staged>> {
        let mut staged = Vec::with_capacity(payloads.len());
        for (path, content, permissions) in payloads {
            let parent = path
                .parent()
                .ok_or_else(|| RewindError::InvalidPath(path.clone()))?;
            let mut prefix = PathBuf::new();
            for component in parent.components() {
                prefix.push(component);
                match fs::create_dir(self.root.join(&prefix)) {
                    Ok(()) => applied.push(Applied::CreatedDir {
                        path: prefix.clone(),
                    }),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let mut temp = tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(self.root.join(parent))?;
            temp.write_all(content)?;
            temp.as_file().sync_data()?;
            set_permissions(temp.path(), *permissions)?;
            staged.push(Staged {
                path: path.clone(),
                temp,
            });
        }
        staged.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(staged)
    }

    /// Reverse applied changes, newest first; returns what could not be undone
    fn undo(&self, applied: &[Applied], backup: &Backup) -> Vec<String> {
        let mut errors = Vec::new();
        for change in applied.iter().rev() {
            let outcome = match change {
                Applied::Wrote {
                    path,
                    had_original: false,
                } => fs::remove_file(self.root.join(path)).map_err(RewindError::from),
                Applied::CreatedDir { path } => remove_dir_if_empty(&self.root.join(path)).map(|_| ()),
                Applied::Cleared { path, was_dir: true } => {
                    copy_tree(&backup.dir.join(path), &self.root.join(path))
                }
                Applied::Wrote { path, .. } | Applied::Deleted { path } | Applied::Cleared { path, .. } => {
                    self.restore_original(path, backup)
                }
            };
            if let Err(e) = outcome {
                errors.push(format!("{}: {}", change.path().display(), e));
            }
        }
        errors
    }

    fn restore_original(&self, path: &Path, backup: &Backup) -> Result<()> {
        let destination = self.root.join(path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(backup.dir.join(path), &destination)?;
        Ok(())
    }
}

/// Recursively copy the directory `from` to `to`, regular files only
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|_| RewindError::InvalidPath(entry.path().to_path_buf()))?;
        let destination = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

fn discard_backup(backup_dir: &Path) {
    match fs::remove_dir_all(backup_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove backup {}: {}", backup_dir.display(), e),
    }
}
