//! # Rewind - snapshots and rollback for agent-edited projects
//!
//! Rewind captures the state of a project directory before and after
//! automated edits, stores file content once no matter how many snapshots
//! reference it, and restores any earlier state on demand without silently
//! destroying edits the user made in between.
//!
//! ## Overview
//!
//! - Snapshots are taken on demand, tagged with an opaque [`ActionContext`]
//! - Content is stored by SHA-256 hash in a compressed, deduplicated blob store
//! - Snapshot metadata, per-file manifests and change records live in a SQLite
//!   index with foreign keys enforcing referential integrity
//! - Incremental scanning rehashes only files whose size or mtime changed
//! - Rollback is previewable, conflict-aware and undone on failure
//! - Retention removes old snapshots by count, age and disk usage while
//!   keeping bookmarked snapshots and the newest one
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rewind::{ActionContext, RollbackOptions, SnapshotEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Storage defaults to ./my_project/.rewind
//! let engine = SnapshotEngine::open("./my_project")?;
//!
//! let before = engine.create_snapshot(
//!     ActionContext::new("file_edit").with_description("Before refactor"),
//! )?;
//!
//! // ... files change ...
//!
//! let preview = engine.preview_rollback(&before, &RollbackOptions::default())?;
//! for conflict in &preview.conflicts {
//!     println!("{} was edited by hand", conflict.path.display());
//! }
//!
//! let result = engine.execute_rollback(&before, &RollbackOptions::default())?;
//! println!("Restored {} files", result.files_restored.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Configuration
//!
//! ```rust,no_run
//! use rewind::{EngineBuilder, RewindConfig};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = RewindConfig::default();
//! config.storage.max_snapshots = 20;
//! config.performance.max_file_size_mb = 10;
//!
//! let engine = EngineBuilder::new()
//!     .config(config)
//!     .storage_path("/var/lib/rewind/my_project")
//!     .background_retention(false)
//!     .build(PathBuf::from("./my_project"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Snapshots
//!
//! A snapshot is an immutable record of every tracked file at one point in
//! time. Ids sort lexically in capture order and each snapshot points at the
//! one before it.
//!
//! ### Conflicts
//!
//! The latest snapshot is the baseline. A file whose current content differs
//! from both the rollback target and the baseline was edited outside of any
//! capture; rollback reports it and, with
//! [`RollbackOptions::preserve_manual_changes`], leaves it alone.
//!
//! ### Retention
//!
//! Snapshots older than the configured age, beyond the configured count or
//! pushing storage past its limit are deleted oldest first. Bookmarked
//! snapshots and the newest snapshot are never deleted. Blobs are reclaimed
//! once no remaining snapshot references them.
//!
//! ## Module Organization
//!
//! - [`engine`]: The [`SnapshotEngine`] facade and its builder
//! - [`storage`]: Content-addressable blob store
//! - [`index`]: SQLite metadata index
//! - [`scanner`]: Incremental directory scanning and change detection
//! - [`rollback`]: Rollback planning and transactional apply
//! - [`retention`]: Retention policy and background worker
//! - [`cache`]: Bounded LRU for lazily loaded content
//! - [`compression`]: Blob codecs
//! - [`config`]: `config.toml` schema
//! - [`types`]: Common records
//! - [`error`]: Error type

pub mod cache;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod retention;
pub mod rollback;
pub mod scanner;
pub mod storage;
pub mod types;

mod collections;
pub mod utils;

pub use cache::{CacheLimits, CacheStats, ContentCache};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use config::{RetentionPolicy, RewindConfig};
pub use engine::{EngineBuilder, IncrementalStats, SnapshotEngine, StorageStats};
pub use error::{Result, RewindError};
pub use index::MetadataIndex;
pub use retention::{RetentionManager, RetentionReport};
pub use rollback::RollbackEngine;
pub use scanner::{ScanOptions, Scanner};
pub use storage::ContentStore;
pub use types::*;
