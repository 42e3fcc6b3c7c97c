//! Snapshot engine
//!
//! [`SnapshotEngine`] is the entry point for everything rewind does to one
//! project root: creating snapshots, reading their content, rolling back and
//! enforcing retention.
//!
//! ## Concurrency
//!
//! Snapshot creation, rollback, deletion and retention serialize on a single
//! operation lock shared with the [`RetentionManager`] and its background
//! worker. Retention therefore never reclaims a blob that an in-flight create
//! has just deduplicated against. Reads (listing, lazy content, previews of
//! retention) do not take the lock.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::{ActionContext, EngineBuilder, RollbackOptions};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = EngineBuilder::new().build(PathBuf::from("./my_project"))?;
//!
//! let before = engine.create_snapshot(ActionContext::new("file_edit"))?;
//! // ... an agent edits files ...
//! let preview = engine.preview_rollback(&before, &RollbackOptions::default())?;
//! println!("{} files would be restored", preview.to_restore.len());
//! engine.execute_rollback(&before, &RollbackOptions::default())?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheLimits, CacheStats, ContentCache};
use crate::collections::{HashMap, HashMapExt, HashSet};
use crate::compression::{CompressionEngine, CompressionStats, CompressionStrategy};
use crate::config::RewindConfig;
use crate::error::{Result, RewindError};
use crate::index::{IndexStats, MetadataIndex, INDEX_FILE_NAME};
use crate::retention::{RetentionManager, RetentionReport, RetentionWorker};
use crate::rollback::RollbackEngine;
use crate::scanner::{detect_changes, ScanOptions, Scanner};
use crate::storage::{ContentStore, StoreStats};
use crate::types::{
    snapshot_id_for, ActionContext, Bookmark, FileChange, FileState, ReclaimStats,
    InclusionPredicate, IntegrityReport, RollbackOptions, RollbackPreview, RollbackResult,
    SnapshotFilter, SnapshotId, SnapshotMetadata,
};
use crate::utils::normalize_relative;

/// Default name of the storage directory inside the project root
pub const DEFAULT_STORAGE_DIR: &str = ".rewind";

/// Combined statistics of the store, the index and the caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    /// Blob store counters
    pub store: StoreStats,
    /// Metadata index counters
    pub index: IndexStats,
    /// Compression counters for this process
    pub compression: CompressionStats,
    /// Lazy content cache counters
    pub cache: CacheStats,
}

/// Incremental scanning state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalStats {
    /// Latest captured snapshot
    pub last_snapshot: Option<SnapshotId>,
    /// Files in the latest captured snapshot
    pub tracked_files: usize,
    /// Signatures in the scanner cache
    pub signature_cache_entries: usize,
    /// Files read and hashed by the last scan
    pub last_scan_rehashed: usize,
    /// Files whose hash was reused by the last scan
    pub last_scan_reused: usize,
    /// Files skipped by the last scan
    pub last_scan_skipped: usize,
}

#[derive(Default)]
struct IncrementalState {
    last_id: Option<SnapshotId>,
    files: HashMap<PathBuf, FileState>,
    rehashed: usize,
    reused: usize,
    skipped: usize,
}

#[derive(Default)]
struct BlobStats {
    written: usize,
    raw_bytes: u64,
    stored_bytes: u64,
}

enum BlobOutcome {
    Stored {
        path: PathBuf,
        hash: String,
        size: u64,
        newly_written: bool,
        stored_size: u64,
    },
    Dropped {
        path: PathBuf,
        reason: String,
    },
}

/// Builder for [`SnapshotEngine`]
///
/// # Default Values
///
/// - configuration: read from `<storage>/config.toml`, defaults if absent
/// - storage path: `<root>/.rewind`
/// - inclusion predicate: none
/// - auto cleanup and background retention: `storage.auto_cleanup`
/// - compression: derived from the `[storage]` configuration
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<RewindConfig>,
    storage_path: Option<PathBuf>,
    inclusion_predicate: Option<InclusionPredicate>,
    auto_cleanup: Option<bool>,
    background_retention: Option<bool>,
    compression_strategy: Option<CompressionStrategy>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("storage_path", &self.storage_path)
            .field("has_predicate", &self.inclusion_predicate.is_some())
            .field("auto_cleanup", &self.auto_cleanup)
            .field("background_retention", &self.background_retention)
            .finish()
    }
}

impl EngineBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of reading `config.toml`
    pub fn config(mut self, config: RewindConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Keep snapshots somewhere other than `<root>/.rewind`
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Only capture files for which `predicate` returns `true`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rewind::EngineBuilder;
    /// use std::sync::Arc;
    ///
    /// let builder = EngineBuilder::new()
    ///     .inclusion_predicate(Arc::new(|path: &std::path::Path| !path.ends_with("secrets.env")));
    /// ```
    pub fn inclusion_predicate(mut self, predicate: InclusionPredicate) -> Self {
        self.inclusion_predicate = Some(predicate);
        self
    }

    /// Run retention after every snapshot
    pub fn auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = Some(enabled);
        self
    }

    /// Run retention periodically on a background thread
    pub fn background_retention(mut self, enabled: bool) -> Self {
        self.background_retention = Some(enabled);
        self
    }

    /// Override the compression strategy for new blobs
    pub fn compression_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.compression_strategy = Some(strategy);
        self
    }

    /// Open (initializing if needed) the engine for `root`
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidPath`] if `root` is not a directory
    /// - [`RewindError::ConfigParse`] or [`RewindError::InvalidConfiguration`]
    ///   for a bad configuration
    /// - [`RewindError::Index`] if the index cannot be opened
    pub fn build(self, root: PathBuf) -> Result<SnapshotEngine> {
        if !root.is_dir() {
            return Err(RewindError::InvalidPath(root));
        }
        let storage_path = self
            .storage_path
            .unwrap_or_else(|| root.join(DEFAULT_STORAGE_DIR));
        fs::create_dir_all(&storage_path)?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => RewindConfig::load(&storage_path)?,
        };

        let strategy = self
            .compression_strategy
            .unwrap_or_else(|| config.storage.compression_strategy());
        let store = Arc::new(ContentStore::init_or_open(
            storage_path.clone(),
            CompressionEngine::new(strategy),
        )?);
        let index = Arc::new(MetadataIndex::open(&storage_path.join(INDEX_FILE_NAME))?);

        let mut scanner = Scanner::new(
            root.clone(),
            storage_path.clone(),
            ScanOptions::from_config(&config),
        );
        if let Some(predicate) = self.inclusion_predicate {
            scanner = scanner.with_predicate(predicate);
        }

        let ops_lock = Arc::new(Mutex::new(()));
        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&store),
            Arc::clone(&index),
            config.storage.retention_policy(),
            Arc::clone(&ops_lock),
        ));
        let cache = Arc::new(ContentCache::new(CacheLimits::from_config(&config.performance)));
        let rollback = RollbackEngine::new(
            root.clone(),
            &storage_path,
            Arc::clone(&store),
            Arc::clone(&index),
        );

        let workers = config.performance.max_workers.min(num_cpus::get()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rewind-worker-{i}"))
            .build()?;

        let auto_cleanup = self.auto_cleanup.unwrap_or(config.storage.auto_cleanup);
        let worker = if self.background_retention.unwrap_or(config.storage.auto_cleanup) {
            let retention = Arc::clone(&retention);
            let cache = Arc::clone(&cache);
            Some(RetentionWorker::spawn(
                config.storage.cleanup_interval()?,
                move || match retention.enforce() {
                    Ok(report) => {
                        for id in &report.deleted {
                            cache.invalidate_snapshot(id);
                        }
                    }
                    Err(e) => warn!("Background retention failed: {}", e),
                },
            )?)
        } else {
            None
        };

        let engine = SnapshotEngine {
            worker,
            root,
            storage_path,
            config,
            store,
            index,
            scanner,
            retention,
            rollback,
            cache,
            pool,
            ops_lock,
            state: RwLock::new(IncrementalState::default()),
            last_micros: Mutex::new(0),
            auto_cleanup,
        };
        engine.refresh_state()?;

        info!(
            "Opened snapshot engine for {:?} (storage {:?})",
            engine.root, engine.storage_path
        );
        Ok(engine)
    }
}

/// Snapshot, storage and rollback engine for one project root
pub struct SnapshotEngine {
    // Dropped first so the background thread is joined before the rest goes
    worker: Option<RetentionWorker>,
    root: PathBuf,
    storage_path: PathBuf,
    config: RewindConfig,
    store: Arc<ContentStore>,
    index: Arc<MetadataIndex>,
    scanner: Scanner,
    retention: Arc<RetentionManager>,
    rollback: RollbackEngine,
    cache: Arc<ContentCache>,
    pool: rayon::ThreadPool,
    ops_lock: Arc<Mutex<()>>,
    state: RwLock<IncrementalState>,
    last_micros: Mutex<i64>,
    auto_cleanup: bool,
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("root", &self.root)
            .field("storage_path", &self.storage_path)
            .field("auto_cleanup", &self.auto_cleanup)
            .field("background_retention", &self.worker.is_some())
            .finish()
    }
}

impl SnapshotEngine {
    /// Open the engine for `root` with default settings
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        EngineBuilder::new().build(root.into())
    }

    /// Project root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage directory
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Effective configuration
    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Capture the current state of the project
    ///
    /// Unchanged files are deduplicated against existing blobs; only new
    /// content is written. The snapshot row, its changes and its manifest are
    /// committed in one transaction.
    ///
    /// # Errors
    ///
    /// - [`RewindError::Timeout`] if the snapshot deadline passed; nothing was
    ///   recorded
    /// - [`RewindError::DiskExhausted`] if the store is still full after an
    ///   emergency retention pass
    /// - [`RewindError::IndexIntegrity`] if the index rejected the snapshot
    #[instrument(skip(self, context), fields(action = %context.action_type))]
    pub fn create_snapshot(&self, context: ActionContext) -> Result<SnapshotId> {
        let id = {
            let _guard = self.ops_lock.lock();
            self.create_locked(&context)?
        };

        if self.auto_cleanup {
            if let Err(e) = self.enforce_retention() {
                warn!("Retention after snapshot {} failed: {}", id, e);
            }
        }
        Ok(id)
    }

    fn create_locked(&self, context: &ActionContext) -> Result<SnapshotId> {
        let start = Instant::now();
        let limit = self.config.performance.snapshot_timeout();

        let report = self.scanner.scan()?;
        check_deadline(start, limit)?;

        let mut states = report.states;
        let blobs = match self.store_blobs(&mut states) {
            Err(RewindError::DiskExhausted(reason)) => {
                warn!("Store full ({}); running emergency retention", reason);
                let freed = self.retention.run(false)?;
                self.forget_deleted(&freed.deleted);
                self.store_blobs(&mut states)?
            }
            other => other?,
        };
        check_deadline(start, limit)?;

        let timestamp = self.next_timestamp()?;
        let id = snapshot_id_for(timestamp);

        let mut manifest: Vec<FileState> = states.values().cloned().collect();
        manifest.sort_by(|a, b| a.path.cmp(&b.path));

        let (changes, parent) = {
            let state = self.state.read();
            (detect_changes(&state.files, &states, &id), state.last_id.clone())
        };

        let compression_ratio = if blobs.raw_bytes > 0 {
            blobs.stored_bytes as f64 / blobs.raw_bytes as f64
        } else {
            1.0
        };
        let metadata = SnapshotMetadata {
            id: id.clone(),
            timestamp,
            action_type: context.action_type.clone(),
            description: context.description.clone(),
            tags: context.tags.clone(),
            parent_snapshot: parent,
            files_affected: changes.len(),
            total_size: manifest.iter().map(|s| s.size).sum(),
            compression_ratio,
            affected_files: context.affected_files.clone(),
            bookmark: None,
        };

        check_deadline(start, limit)?;
        self.index.record_snapshot(&metadata, &changes, &manifest)?;

        {
            let mut state = self.state.write();
            state.last_id = Some(id.clone());
            state.files = states;
            state.rehashed = report.rehashed;
            state.reused = report.reused;
            state.skipped = report.skipped.len();
        }

        info!(
            "Created snapshot {} ({} files, {} changes, {} new blobs) in {:?}",
            id,
            manifest.len(),
            changes.len(),
            blobs.written,
            start.elapsed()
        );
        Ok(id)
    }

    /// Write a blob for every state whose hash is not stored yet
    ///
    /// Files are re-read and re-hashed so content that changed after the scan
    /// is captured consistently. Files that vanished or became unreadable are
    /// dropped from `states`.
    fn store_blobs(&self, states: &mut HashMap<PathBuf, FileState>) -> Result<BlobStats> {
        let pending: Vec<PathBuf> = states
            .values()
            .filter(|s| !self.store.exists(&s.content_hash))
            .map(|s| s.path.clone())
            .collect();
        if pending.is_empty() {
            return Ok(BlobStats::default());
        }
        debug!("Storing {} new blobs", pending.len());

        let store_one = |path: &PathBuf| -> Result<BlobOutcome> {
            let content = match fs::read(self.root.join(path)) {
                Ok(content) => content,
                Err(e) => {
                    return Ok(BlobOutcome::Dropped {
                        path: path.clone(),
                        reason: e.to_string(),
                    })
                }
            };
            let stored = self.store.store(&content, path)?;
            Ok(BlobOutcome::Stored {
                path: path.clone(),
                hash: stored.hash,
                size: content.len() as u64,
                newly_written: stored.newly_written,
                stored_size: stored.stored_size,
            })
        };

        let parallel = self.config.performance.parallel_processing
            && pending.len() > self.config.performance.parallel_threshold;
        let outcomes: Vec<BlobOutcome> = if parallel {
            self.pool
                .install(|| pending.par_iter().map(store_one).collect::<Result<Vec<_>>>())?
        } else {
            pending.iter().map(store_one).collect::<Result<Vec<_>>>()?
        };

        let mut stats = BlobStats::default();
        for outcome in outcomes {
            match outcome {
                BlobOutcome::Stored {
                    path,
                    hash,
                    size,
                    newly_written,
                    stored_size,
                } => {
                    if newly_written {
                        stats.written += 1;
                        stats.raw_bytes += size;
                        stats.stored_bytes += stored_size;
                    }
                    if let Some(state) = states.get_mut(&path) {
                        if state.content_hash != hash {
                            debug!("{} changed during snapshot", path.display());
                            state.content_hash = hash;
                            state.size = size;
                        }
                    }
                }
                BlobOutcome::Dropped { path, reason } => {
                    warn!("Dropping {} from snapshot: {}", path.display(), reason);
                    states.remove(&path);
                }
            }
        }
        Ok(stats)
    }

    /// Strictly increasing capture time
    fn next_timestamp(&self) -> Result<DateTime<Utc>> {
        let mut last = self.last_micros.lock();
        let now = Utc::now().timestamp_micros();
        let micros = if now > *last { now } else { *last + 1 };
        *last = micros;
        DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| RewindError::internal(format!("timestamp {} out of range", micros)))
    }

    /// Reload the incremental state from the latest snapshot in the index
    fn refresh_state(&self) -> Result<()> {
        let latest = self.index.latest_snapshot()?;
        let mut state = self.state.write();
        match latest {
            Some(metadata) => {
                let files = self.index.file_states(&metadata.id)?;
                self.scanner.seed(files.iter());
                {
                    let mut last = self.last_micros.lock();
                    *last = (*last).max(metadata.timestamp.timestamp_micros());
                }
                state.files = files.into_iter().map(|s| (s.path.clone(), s)).collect();
                state.last_id = Some(metadata.id);
            }
            None => {
                state.files = HashMap::new();
                state.last_id = None;
            }
        }
        Ok(())
    }

    /// Drop cached data of deleted snapshots
    fn forget_deleted(&self, ids: &[SnapshotId]) {
        for id in ids {
            self.cache.invalidate_snapshot(id);
        }
        let stale = {
            let state = self.state.read();
            state.last_id.as_ref().is_some_and(|last| ids.contains(last))
        };
        if stale {
            if let Err(e) = self.refresh_state() {
                warn!("Failed to refresh incremental state: {}", e);
            }
        }
    }

    /// Load a snapshot's metadata
    pub fn get_snapshot(&self, id: &str) -> Result<SnapshotMetadata> {
        self.index.get_snapshot(id)
    }

    /// The most recent snapshot, if any
    pub fn latest_snapshot(&self) -> Result<Option<SnapshotMetadata>> {
        self.index.latest_snapshot()
    }

    /// Snapshots matching `filter`, oldest first
    pub fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotMetadata>> {
        self.index.list_snapshots(filter)
    }

    /// Manifest of a snapshot, sorted by path
    pub fn get_snapshot_files(&self, id: &str) -> Result<Vec<FileState>> {
        self.index.file_states(id)
    }

    /// Changes recorded with a snapshot
    pub fn get_file_changes(&self, id: &str) -> Result<Vec<FileChange>> {
        self.index.file_changes(id)
    }

    /// Content of `path` as captured in snapshot `id`
    ///
    /// Returns `None` if the file did not exist in that snapshot. Results are
    /// memoized in a bounded LRU.
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] for an unknown snapshot
    /// - [`RewindError::StoreCorruption`] or [`RewindError::ObjectNotFound`]
    ///   if the blob is unusable
    pub fn get_file_content_lazy(&self, id: &str, path: &Path) -> Result<Option<Arc<[u8]>>> {
        let path = normalize_relative(path)?;
        if let Some(content) = self.cache.get(id, &path) {
            return Ok(Some(content));
        }

        let Some(state) = self.index.file_state(id, &path)? else {
            return Ok(None);
        };
        let content: Arc<[u8]> = self.store.get(&state.content_hash)?.into();
        self.cache.insert(id, &path, Arc::clone(&content));
        Ok(Some(content))
    }

    /// Warm the content cache for `paths` of snapshot `id`
    ///
    /// An empty `paths` preloads the whole manifest. Returns the number of
    /// entries added; files that fail to load are logged and skipped.
    pub fn preload(&self, id: &str, paths: &[PathBuf]) -> Result<usize> {
        let states = if paths.is_empty() {
            self.index.file_states(id)?
        } else {
            if !self.index.snapshot_exists(id)? {
                return Err(RewindError::SnapshotNotFound(id.to_string()));
            }
            let mut states = Vec::with_capacity(paths.len());
            for path in paths {
                if let Some(state) = self.index.file_state(id, &normalize_relative(path)?)? {
                    states.push(state);
                }
            }
            states
        };

        let loaded = self.pool.install(|| {
            states
                .par_iter()
                .filter(|state| !self.cache.contains(id, &state.path))
                .map(|state| match self.store.get(&state.content_hash) {
                    Ok(content) => usize::from(self.cache.insert(id, &state.path, content.into())),
                    Err(e) => {
                        warn!("Failed to preload {}: {}", state.path.display(), e);
                        0
                    }
                })
                .sum()
        });
        debug!("Preloaded {} files of snapshot {}", loaded, id);
        Ok(loaded)
    }

    /// Plan a rollback without touching anything
    pub fn preview_rollback(&self, id: &str, options: &RollbackOptions) -> Result<RollbackPreview> {
        let _guard = self.ops_lock.lock();
        let report = self.scanner.scan()?;
        self.rollback.preview(id, &report.states, options)
    }

    /// Restore the project to snapshot `id`
    ///
    /// With `options.safety_snapshot`, a `pre_rollback` snapshot of the current
    /// state is taken first and its id returned in the result. Conflicts are
    /// judged against the latest snapshot from before that capture, and the
    /// target is kept out of retention until the rollback returns.
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] for an unknown target
    /// - [`RewindError::RollbackFailed`] if applying failed; applied changes
    ///   were undone
    pub fn execute_rollback(&self, id: &str, options: &RollbackOptions) -> Result<RollbackResult> {
        let _pin = self.retention.pin(id);

        let mut result = {
            let _guard = self.ops_lock.lock();
            if !self.index.snapshot_exists(id)? {
                return Err(RewindError::SnapshotNotFound(id.to_string()));
            }
            let baseline = self.index.latest_snapshot()?.map(|s| s.id);

            let safety_snapshot = if options.safety_snapshot && !options.dry_run {
                let context = ActionContext::new("pre_rollback")
                    .with_description(format!("Before rollback to {}", id));
                Some(self.create_locked(&context)?)
            } else {
                None
            };

            let report = self.scanner.scan()?;
            let mut result =
                self.rollback
                    .execute_against(id, baseline.as_deref(), &report.states, options)?;
            result.safety_snapshot = safety_snapshot;
            result
        };

        // Retention deferred from the safety snapshot
        if result.safety_snapshot.is_some() && self.auto_cleanup {
            if let Err(e) = self.enforce_retention() {
                warn!("Retention after rollback to {} failed: {}", id, e);
                result.warnings.push(format!("retention failed: {}", e));
            }
        }
        Ok(result)
    }

    /// Delete a snapshot and reclaim blobs nothing else references
    pub fn delete_snapshot(&self, id: &str) -> Result<ReclaimStats> {
        let start = Instant::now();
        let _guard = self.ops_lock.lock();

        let unreferenced = self.index.delete_snapshot(id)?;
        let mut stats = ReclaimStats {
            blobs_scanned: unreferenced.len(),
            ..Default::default()
        };
        for hash in &unreferenced {
            match self.store.delete(hash) {
                Ok(0) => {}
                Ok(bytes) => {
                    stats.blobs_removed += 1;
                    stats.bytes_reclaimed += bytes;
                }
                Err(e) => warn!("Failed to reclaim blob {}: {}", hash, e),
            }
        }
        stats.unreferenced = unreferenced;
        stats.duration_ms = start.elapsed().as_millis() as u64;

        self.forget_deleted(&[id.to_string()]);
        info!(
            "Deleted snapshot {} ({} blobs reclaimed)",
            id, stats.blobs_removed
        );
        Ok(stats)
    }

    /// Bookmark a snapshot, protecting it from retention
    pub fn add_bookmark(&self, id: &str, name: &str, description: &str) -> Result<Bookmark> {
        self.index.add_bookmark(id, name, description)
    }

    /// Remove a snapshot's bookmark
    pub fn remove_bookmark(&self, id: &str) -> Result<bool> {
        self.index.remove_bookmark(id)
    }

    /// All bookmarks, oldest snapshot first
    pub fn list_bookmarks(&self) -> Result<Vec<Bookmark>> {
        self.index.list_bookmarks()
    }

    /// Apply the retention policy now
    pub fn enforce_retention(&self) -> Result<RetentionReport> {
        let report = self.retention.enforce()?;
        self.forget_deleted(&report.deleted);
        Ok(report)
    }

    /// Evaluate the retention policy without deleting anything
    pub fn preview_retention(&self) -> Result<RetentionReport> {
        self.retention.preview()
    }

    /// Store, index, compression and cache statistics
    pub fn storage_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            store: self.store.stats()?,
            index: self.index.stats()?,
            compression: self.store.compression_stats(),
            cache: self.cache.stats(),
        })
    }

    /// Cross-check the store against the index
    ///
    /// Reports blobs that fail verification, blobs the index references but
    /// the store lacks, and blobs nothing references.
    #[instrument(skip(self))]
    pub fn validate_integrity(&self) -> Result<IntegrityReport> {
        let start = Instant::now();
        let _guard = self.ops_lock.lock();

        let (objects_checked, corrupted_objects) = self.store.validate_integrity()?;
        let referenced = self.index.referenced_hashes()?;
        let stored: HashSet<String> = self.store.list_all()?.into_iter().collect();

        let mut missing_objects: Vec<String> = referenced
            .iter()
            .filter(|h| !stored.contains(*h))
            .cloned()
            .collect();
        missing_objects.sort();
        let mut orphaned_objects: Vec<String> = stored
            .iter()
            .filter(|h| !referenced.contains(*h))
            .cloned()
            .collect();
        orphaned_objects.sort();

        let violations = self.index.foreign_key_violations()?;
        if violations > 0 {
            warn!("Index has {} foreign key violations", violations);
        }

        let report = IntegrityReport {
            objects_checked,
            missing_objects,
            corrupted_objects,
            orphaned_objects,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if report.is_valid() {
            info!("Integrity check passed ({} objects)", report.objects_checked);
        } else {
            warn!(
                "Integrity check found {} missing, {} corrupted, {} orphaned objects",
                report.missing_objects.len(),
                report.corrupted_objects.len(),
                report.orphaned_objects.len()
            );
        }
        Ok(report)
    }

    /// Remove blobs no snapshot references
    ///
    /// With `dry_run`, reports what would be removed without deleting.
    pub fn cleanup_orphans(&self, dry_run: bool) -> Result<ReclaimStats> {
        let _guard = self.ops_lock.lock();
        let referenced = self.index.referenced_hashes()?;
        self.store.cleanup_orphans(&referenced, dry_run)
    }

    /// Drop the content cache and the scanner's signatures
    pub fn clear_caches(&self) {
        self.cache.clear();
        self.scanner.clear_signatures();
        debug!("Cleared content cache and scan signatures");
    }

    /// Lazy content cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Incremental scanning counters
    pub fn incremental_stats(&self) -> IncrementalStats {
        let state = self.state.read();
        IncrementalStats {
            last_snapshot: state.last_id.clone(),
            tracked_files: state.files.len(),
            signature_cache_entries: self.scanner.signature_count(),
            last_scan_rehashed: state.rehashed,
            last_scan_reused: state.reused,
            last_scan_skipped: state.skipped,
        }
    }
}

fn check_deadline(start: Instant, limit: Option<Duration>) -> Result<()> {
    match limit {
        Some(limit) if start.elapsed() > limit => Err(RewindError::Timeout {
            operation: "create_snapshot".to_string(),
            limit_ms: limit.as_millis() as u64,
        }),
        _ => Ok(()),
    }
}
