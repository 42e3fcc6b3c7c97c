//! Core data types used throughout the rewind library
//!
//! This module contains the records that flow between the scanner, the content
//! store, the metadata index and the rollback engine.
//!
//! ## Overview
//!
//! - **Inputs**: [`ActionContext`], [`SnapshotFilter`], [`RollbackOptions`], [`InclusionPredicate`]
//! - **Snapshot records**: [`SnapshotMetadata`], [`FileState`], [`FileChange`], [`Bookmark`]
//! - **Results**: [`RollbackPreview`], [`RollbackResult`], [`ReclaimStats`], [`IntegrityReport`]
//!
//! ## Examples
//!
//! ```rust
//! use rewind::types::ActionContext;
//!
//! let context = ActionContext::new("file_edit")
//!     .with_description("Before refactoring the parser")
//!     .with_tag("refactor");
//!
//! assert_eq!(context.action_type, "file_edit");
//! assert!(context.tags.contains("refactor"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, RewindError};

/// Identifier of a snapshot
///
/// Ids are fixed-width: 13 hex digits of microseconds since the epoch followed
/// by a random suffix, so lexical order equals timeline order.
pub type SnapshotId = String;

/// External file inclusion filter
///
/// Receives the project-relative path of every candidate file. Returning
/// `false` keeps the file out of the snapshot.
pub type InclusionPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Build a snapshot id for the given timestamp
pub fn snapshot_id_for(timestamp: DateTime<Utc>) -> SnapshotId {
    let micros = timestamp.timestamp_micros().max(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013x}-{}", micros, &suffix[..8])
}

/// Opaque description of the action that triggered a snapshot
///
/// The engine never interprets these fields; they are stored on the
/// snapshot unchanged and are available for filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionContext {
    /// Kind of action (e.g. `file_edit`, `bash_command`, `manual`)
    pub action_type: String,
    /// Human readable description
    pub description: String,
    /// Free-form tags
    pub tags: BTreeSet<String>,
    /// Files the caller expects the action to touch
    pub affected_files: Option<Vec<PathBuf>>,
}

impl ActionContext {
    /// Create a context for the given action type
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Default::default()
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set the affected files hint
    pub fn with_affected_files(mut self, files: Vec<PathBuf>) -> Self {
        self.affected_files = Some(files);
        self
    }
}

/// A named, retention-protected marker on a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Snapshot being bookmarked
    pub snapshot_id: SnapshotId,
    /// Bookmark name
    pub name: String,
    /// Optional description
    pub description: String,
    /// When the bookmark was created
    pub created_at: DateTime<Utc>,
}

/// Metadata of a recorded snapshot
///
/// Immutable once recorded. Only retention or an explicit delete removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Unique, sortable id
    pub id: SnapshotId,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Action type from the [`ActionContext`]
    pub action_type: String,
    /// Description from the [`ActionContext`]
    pub description: String,
    /// Tags from the [`ActionContext`]
    pub tags: BTreeSet<String>,
    /// Previous snapshot in the timeline
    pub parent_snapshot: Option<SnapshotId>,
    /// Number of files added, modified or deleted relative to the parent
    pub files_affected: usize,
    /// Total size of all tracked files at capture time
    pub total_size: u64,
    /// Stored bytes divided by raw bytes for blobs written by this snapshot
    pub compression_ratio: f64,
    /// Affected files hint from the [`ActionContext`]
    pub affected_files: Option<Vec<PathBuf>>,
    /// Bookmark on this snapshot, if any
    pub bookmark: Option<Bookmark>,
}

impl SnapshotMetadata {
    /// Get short id (first 8 characters of the random suffix)
    pub fn short_id(&self) -> &str {
        match self.id.split_once('-') {
            Some((_, suffix)) => suffix,
            None => &self.id,
        }
    }

    /// Whether retention must keep this snapshot
    pub fn is_protected(&self) -> bool {
        self.bookmark.is_some()
    }
}

/// State of one tracked file at capture time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Project-relative path
    pub path: PathBuf,
    /// SHA-256 hash of the content
    pub content_hash: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified_time: DateTime<Utc>,
    /// Unix permission bits
    pub permissions: u32,
    /// Whether the file exists
    pub exists: bool,
}

/// Kind of change between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Present only in the newer state
    Added,
    /// Present in both with different content
    Modified,
    /// Present only in the older state
    Deleted,
}

impl ChangeType {
    /// Name stored in the index
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "added" => Ok(ChangeType::Added),
            "modified" => Ok(ChangeType::Modified),
            "deleted" => Ok(ChangeType::Deleted),
            other => Err(RewindError::IndexIntegrity(format!(
                "unknown change type '{}'",
                other
            ))),
        }
    }
}

/// A per-file change recorded with a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Snapshot the change belongs to
    pub snapshot_id: SnapshotId,
    /// Project-relative path
    pub file_path: PathBuf,
    /// Kind of change
    pub change_type: ChangeType,
    /// New content hash, `None` for deletions
    pub content_hash: Option<String>,
    /// Previous content hash, `None` for additions
    pub previous_hash: Option<String>,
    /// New size (previous size for deletions)
    pub size: u64,
}

/// Filter for listing snapshots
///
/// Empty fields do not restrict the result.
///
/// # Examples
///
/// ```rust
/// use rewind::types::SnapshotFilter;
///
/// let filter = SnapshotFilter::default()
///     .with_action_type("file_edit")
///     .with_tag("refactor")
///     .with_limit(10);
/// assert_eq!(filter.limit, Some(10));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Keep snapshots carrying any of these tags
    pub tags: Vec<String>,
    /// Keep snapshots with one of these action types
    pub action_types: Vec<String>,
    /// Keep snapshots at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Keep snapshots at or before this time
    pub until: Option<DateTime<Utc>>,
    /// Keep only bookmarked snapshots
    pub bookmarked_only: bool,
    /// Keep snapshots that changed a path matching any of these globs
    pub file_patterns: Vec<String>,
    /// Maximum number of results (the oldest matches are returned first)
    pub limit: Option<usize>,
}

impl SnapshotFilter {
    /// Require one of the given tags
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Require one of the given action types
    pub fn with_action_type(mut self, action_type: impl Into<String>) -> Self {
        self.action_types.push(action_type.into());
        self
    }

    /// Restrict to a time range
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Require a changed path matching the glob
    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_patterns.push(pattern.into());
        self
    }

    /// Keep only bookmarked snapshots
    pub fn bookmarked(mut self) -> Self {
        self.bookmarked_only = true;
        self
    }

    /// Limit the number of results
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Outcome of reclaiming blobs, after a snapshot deletion or an orphan sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimStats {
    pub blobs_scanned: usize,
    /// Zero on a dry run
    pub blobs_removed: usize,
    /// Bytes freed, or that a dry run would free
    pub bytes_reclaimed: u64,
    pub duration_ms: u64,
    /// Hashes no snapshot references
    pub unreferenced: Vec<String>,
}

/// Metadata stored with the content store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Version of storage format
    pub format_version: u32,
    /// Crate version that created the storage
    pub rewind_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Result of a full consistency check across index and store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Objects read and re-hashed
    pub objects_checked: usize,
    /// Referenced hashes with no stored object
    pub missing_objects: Vec<String>,
    /// Stored objects that failed to decode or re-hash
    pub corrupted_objects: Vec<String>,
    /// Stored objects no index row references
    pub orphaned_objects: Vec<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl IntegrityReport {
    /// No missing or corrupted objects (orphans are harmless)
    pub fn is_valid(&self) -> bool {
        self.missing_objects.is_empty() && self.corrupted_objects.is_empty()
    }
}

/// Options for rollback preview and execution
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Restrict the rollback to these project-relative paths
    pub selective_files: Vec<PathBuf>,
    /// Leave conflicting files untouched instead of overwriting them
    pub preserve_manual_changes: bool,
    /// Compute the plan without touching the working tree
    pub dry_run: bool,
    /// Keep the backup of replaced files after a successful rollback
    pub create_backup: bool,
    /// Capture a `pre_rollback` snapshot before applying
    pub safety_snapshot: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            selective_files: Vec::new(),
            preserve_manual_changes: false,
            dry_run: false,
            create_backup: true,
            safety_snapshot: false,
        }
    }
}

impl RollbackOptions {
    /// Restrict to the given files
    pub fn selective(files: Vec<PathBuf>) -> Self {
        Self {
            selective_files: files,
            ..Default::default()
        }
    }

    /// Whether this is a full rollback
    pub fn is_full(&self) -> bool {
        self.selective_files.is_empty()
    }
}

/// How a file diverged from the last capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Content changed since the last capture
    ModifiedSinceCapture,
    /// File appeared after the last capture
    CreatedSinceCapture,
    /// File disappeared after the last capture
    DeletedSinceCapture,
}

/// A file whose current content differs from both the target and the last capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    /// Project-relative path
    pub path: PathBuf,
    /// Kind of divergence
    pub kind: ConflictKind,
    /// Hash of the current content, if the file exists
    pub current_hash: Option<String>,
    /// Hash at the target snapshot, if present there
    pub target_hash: Option<String>,
    /// Hash at the last capture, if present there
    pub captured_hash: Option<String>,
}

/// Plan computed by a rollback preview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPreview {
    /// Target snapshot
    pub target_id: SnapshotId,
    /// Snapshot used as the common ancestor for conflict detection
    pub baseline_id: Option<SnapshotId>,
    /// Paths whose target content differs from the working tree
    pub to_restore: Vec<PathBuf>,
    /// Paths present now but absent at target (full rollback only)
    pub to_delete: Vec<PathBuf>,
    /// Paths edited outside of any capture
    pub conflicts: Vec<FileConflict>,
    /// Bytes that would be written
    pub bytes_to_write: u64,
}

impl RollbackPreview {
    /// Whether applying the plan would change anything
    pub fn has_changes(&self) -> bool {
        !self.to_restore.is_empty() || !self.to_delete.is_empty()
    }

    /// Whether the path has a conflict
    pub fn is_conflicted(&self, path: &Path) -> bool {
        self.conflicts.iter().any(|c| c.path == path)
    }
}

/// Result of a rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Snapshot that was restored
    pub target_id: SnapshotId,
    /// Files written
    pub files_restored: Vec<PathBuf>,
    /// Files removed
    pub files_deleted: Vec<PathBuf>,
    /// Conflicting files left untouched
    pub conflicts_preserved: Vec<FileConflict>,
    /// Conflicting files overwritten
    pub conflicts_overwritten: Vec<FileConflict>,
    /// Backup of replaced files, when kept
    pub backup_path: Option<PathBuf>,
    /// Snapshot taken before applying, when requested
    pub safety_snapshot: Option<SnapshotId>,
    /// Total bytes written
    pub bytes_written: u64,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Any warnings during the rollback
    pub warnings: Vec<String>,
}

impl RollbackResult {
    pub(crate) fn empty(target_id: SnapshotId, dry_run: bool) -> Self {
        Self {
            target_id,
            files_restored: Vec::new(),
            files_deleted: Vec::new(),
            conflicts_preserved: Vec::new(),
            conflicts_overwritten: Vec::new(),
            backup_path: None,
            safety_snapshot: None,
            bytes_written: 0,
            duration_ms: 0,
            dry_run,
            warnings: Vec::new(),
        }
    }
}
