//! Project scanning and change detection
//!
//! The [`Scanner`] walks a project root and produces a [`FileState`] for every
//! regular file that survives the exclusion rules:
//!
//! - `.gitignore`/`.ignore` files (when enabled)
//! - the configured excluded directory names and the storage directory, pruned
//!   before descent
//! - the external [`InclusionPredicate`], consulted with the relative path
//!
//! Hidden files are included. Symbolic links are neither followed nor recorded.
//!
//! ## Incremental hashing
//!
//! Each scanner keeps a signature cache of `(mtime, size, hash)` per path. A
//! file whose mtime and size both match its cached signature is not re-read.
//! The cache is bounded; when it is full the oldest tenth is evicted.
//!
//! Two edits to the same file with equal size inside one mtime tick are
//! indistinguishable by signature. Files modified within the last two seconds
//! are therefore always rehashed; only older signatures are cached.
//!
//! ## Failures
//!
//! Nothing a single file does can fail a scan. Unreadable, vanished, oversized
//! and timed-out files are logged and returned in [`ScanReport::skipped`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::collections::{FastHasher, HashMap, HashMapExt, HashSet};
use crate::config::RewindConfig;
use crate::error::{Result, RewindError};
use crate::types::{ChangeType, FileChange, FileState, InclusionPredicate};
use crate::utils::{hash_file_with_deadline, make_relative, stat_entry};

/// Knobs that control a scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Honor `.gitignore` and `.ignore` files
    pub respect_gitignore: bool,
    /// Directory names pruned wherever they occur
    pub excluded_dirs: Vec<String>,
    /// Files above this size are skipped
    pub max_file_size: Option<u64>,
    /// Allow hashing on a worker pool
    pub parallel: bool,
    /// Upper bound on worker threads
    pub max_workers: usize,
    /// Minimum candidate count before the pool is used
    pub parallel_threshold: usize,
    /// Per-file hashing deadline in milliseconds, 0 disables it
    pub file_timeout_ms: u64,
    /// Maximum number of cached signatures
    pub signature_cache_limit: usize,
}

impl ScanOptions {
    /// Derive scan options from an engine configuration
    pub fn from_config(config: &RewindConfig) -> Self {
        Self {
            respect_gitignore: config.scan.respect_gitignore,
            excluded_dirs: config.scan.excluded_dirs.clone(),
            max_file_size: config.performance.max_file_size_bytes(),
            parallel: config.performance.parallel_processing,
            max_workers: config.performance.max_workers,
            parallel_threshold: config.performance.parallel_threshold,
            file_timeout_ms: config.performance.file_timeout_ms,
            signature_cache_limit: config.performance.signature_cache_limit,
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&RewindConfig::default())
    }
}

/// A file the scan could not capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    /// Project-relative path
    pub path: PathBuf,
    /// Why it was skipped
    pub reason: String,
}

/// Result of one scan
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Current state of every captured file, keyed by relative path
    pub states: HashMap<PathBuf, FileState>,
    /// Files whose content was read and hashed
    pub rehashed: usize,
    /// Files whose hash came from the signature cache
    pub reused: usize,
    /// Files left out because of a per-file failure
    pub skipped: Vec<SkippedFile>,
    /// Wall time of the scan
    pub duration: Duration,
}

impl ScanReport {
    /// Sum of the sizes of all captured files
    pub fn total_size(&self) -> u64 {
        self.states.values().map(|s| s.size).sum()
    }
}

/// Signatures of files modified this recently are not trusted
const RACY_WINDOW_SECS: i64 = 2;

#[derive(Debug, Clone)]
struct Signature {
    modified: DateTime<Utc>,
    size: u64,
    hash: String,
    tick: u64,
}

enum Outcome {
    Captured { state: FileState, rehashed: bool },
    Skipped(SkippedFile),
    Ignored,
}

/// Walks a project root and hashes its files
pub struct Scanner {
    root: PathBuf,
    storage_dir: PathBuf,
    options: ScanOptions,
    predicate: Option<InclusionPredicate>,
    signatures: DashMap<PathBuf, Signature, FastHasher>,
    tick: AtomicU64,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("root", &self.root)
            .field("storage_dir", &self.storage_dir)
            .field("options", &self.options)
            .field("has_predicate", &self.predicate.is_some())
            .field("signatures", &self.signatures.len())
            .finish()
    }
}

impl Scanner {
    /// Create a scanner for `root`, never descending into `storage_dir`
    pub fn new(root: PathBuf, storage_dir: PathBuf, options: ScanOptions) -> Self {
        Self {
            root,
            storage_dir,
            options,
            predicate: None,
            signatures: DashMap::with_hasher(FastHasher::default()),
            tick: AtomicU64::new(0),
        }
    }

    /// Filter candidate files through an external predicate
    pub fn with_predicate(mut self, predicate: InclusionPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Project root being scanned
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active scan options
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Seed the signature cache from a captured manifest
    pub fn seed<'a, I>(&self, states: I)
    where
        I: IntoIterator<Item = &'a FileState>,
    {
        for state in states {
            self.remember(
                state.path.clone(),
                state.modified_time,
                state.size,
                state.content_hash.clone(),
            );
        }
    }

    /// Forget every cached signature
    pub fn clear_signatures(&self) {
        self.signatures.clear();
    }

    /// Number of cached signatures
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Scan the project root
    ///
    /// # Errors
    ///
    /// Only setup failures surface: a missing root or a worker pool that
    /// cannot be built. Per-file problems end up in [`ScanReport::skipped`].
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn scan(&self) -> Result<ScanReport> {
        let start = Instant::now();
        if !self.root.is_dir() {
            return Err(RewindError::InvalidPath(self.root.clone()));
        }

        let mut report = ScanReport::default();
        let candidates = self.collect_candidates();

        let use_pool =
            self.options.parallel && candidates.len() > self.options.parallel_threshold;
        let outcomes: Vec<Outcome> = if use_pool {
            let workers = self
                .options
                .max_workers
                .min(num_cpus::get())
                .min(candidates.len())
                .max(1);
            trace!("Hashing {} files on {} workers", candidates.len(), workers);
            let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
            pool.install(|| candidates.par_iter().map(|path| self.scan_file(path)).collect())
        } else {
            candidates.iter().map(|path| self.scan_file(path)).collect()
        };

        report.states = HashMap::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Captured { state, rehashed } => {
                    if rehashed {
                        report.rehashed += 1;
                    } else {
                        report.reused += 1;
                    }
                    report.states.insert(state.path.clone(), state);
                }
                Outcome::Skipped(skipped) => {
                    warn!("Skipping {}: {}", skipped.path.display(), skipped.reason);
                    report.skipped.push(skipped);
                }
                Outcome::Ignored => {}
            }
        }

        // Signatures of files that are gone would only waste cache slots
        self.signatures.retain(|path, _| report.states.contains_key(path));

        report.duration = start.elapsed();
        debug!(
            "Scanned {} files ({} rehashed, {} reused, {} skipped) in {:?}",
            report.states.len(),
            report.rehashed,
            report.reused,
            report.skipped.len(),
            report.duration
        );
        Ok(report)
    }

    /// Walk the tree and return relative paths of candidate files
    fn collect_candidates(&self) -> Vec<PathBuf> {
        let excluded: HashSet<String> = self.options.excluded_dirs.iter().cloned().collect();
        let storage_dir = self.storage_dir.clone();

        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .parents(true)
            .ignore(self.options.respect_gitignore)
            .git_ignore(self.options.respect_gitignore)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
                if !is_dir {
                    return true;
                }
                if entry.path() == storage_dir {
                    return false;
                }
                !excluded.contains(&*entry.file_name().to_string_lossy())
            });

        let mut candidates = Vec::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Walk error: {}", e);
                    continue;
                }
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                trace!("Not recording symlink {}", entry.path().display());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = match make_relative(entry.path(), &self.root) {
                Ok(relative) => relative,
                Err(e) => {
                    warn!("Cannot relativize {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if let Some(predicate) = &self.predicate {
                if !predicate(&relative) {
                    trace!("Excluded by predicate: {}", relative.display());
                    continue;
                }
            }
            candidates.push(relative);
        }

        candidates
    }

    fn scan_file(&self, relative: &Path) -> Outcome {
        let full_path = self.root.join(relative);
        let skipped = |reason: String| {
            Outcome::Skipped(SkippedFile {
                path: relative.to_path_buf(),
                reason,
            })
        };

        let metadata = match stat_entry(&full_path) {
            Ok(metadata) => metadata,
            Err(RewindError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return skipped("vanished during scan".to_string());
            }
            Err(e) => return skipped(e.to_string()),
        };
        if !metadata.is_regular_file() {
            return Outcome::Ignored;
        }
        if let Some(max_size) = self.options.max_file_size {
            if metadata.size > max_size {
                return skipped(format!(
                    "size {} exceeds limit of {} bytes",
                    metadata.size, max_size
                ));
            }
        }

        let modified = metadata.modified;
        let cached = self
            .signatures
            .get(relative)
            .filter(|sig| sig.modified == modified && sig.size == metadata.size)
            .map(|sig| sig.hash.clone());

        let (content_hash, rehashed) = match cached {
            Some(hash) => (hash, false),
            None => {
                let deadline = (self.options.file_timeout_ms > 0).then(|| {
                    (
                        Instant::now() + Duration::from_millis(self.options.file_timeout_ms),
                        self.options.file_timeout_ms,
                    )
                });
                match hash_file_with_deadline(&full_path, deadline) {
                    Ok(hash) => {
                        self.remember(relative.to_path_buf(), modified, metadata.size, hash.clone());
                        (hash, true)
                    }
                    Err(RewindError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        return skipped("vanished during scan".to_string());
                    }
                    Err(e) => return skipped(e.to_string()),
                }
            }
        };

        Outcome::Captured {
            state: FileState {
                path: relative.to_path_buf(),
                content_hash,
                size: metadata.size,
                modified_time: modified,
                permissions: metadata.mode,
                exists: true,
            },
            rehashed,
        }
    }

    fn remember(&self, path: PathBuf, modified: DateTime<Utc>, size: u64, hash: String) {
        let limit = self.options.signature_cache_limit;
        if limit == 0 {
            return;
        }
        // A same-size rewrite inside one timestamp tick would be invisible
        if modified > Utc::now() - chrono::Duration::seconds(RACY_WINDOW_SECS) {
            trace!("Not caching racy signature of {}", path.display());
            return;
        }
        if self.signatures.len() >= limit && !self.signatures.contains_key(&path) {
            self.evict_oldest(limit);
        }
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        self.signatures.insert(
            path,
            Signature {
                modified,
                size,
                hash,
                tick,
            },
        );
    }

    fn evict_oldest(&self, limit: usize) {
        let mut ticks: Vec<(u64, PathBuf)> = self
            .signatures
            .iter()
            .map(|entry| (entry.value().tick, entry.key().clone()))
            .collect();
        ticks.sort_unstable_by_key(|(tick, _)| *tick);

        let evict = (limit / 10).max(1);
        for (_, path) in ticks.into_iter().take(evict) {
            self.signatures.remove(&path);
        }
        trace!("Evicted {} signatures", evict);
    }
}

/// Diff two states into change records for `snapshot_id`
///
/// Files only in `current` are added, files in both with different hashes are
/// modified and files only in `prior` are deleted. The result is sorted by
/// path.
pub fn detect_changes(
    prior: &HashMap<PathBuf, FileState>,
    current: &HashMap<PathBuf, FileState>,
    snapshot_id: &str,
) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for (path, state) in current {
        match prior.get(path) {
            Some(old) if old.content_hash == state.content_hash => {}
            Some(old) => changes.push(FileChange {
                snapshot_id: snapshot_id.to_string(),
                file_path: path.clone(),
                change_type: ChangeType::Modified,
                content_hash: Some(state.content_hash.clone()),
                previous_hash: Some(old.content_hash.clone()),
                size: state.size,
            }),
            None => changes.push(FileChange {
                snapshot_id: snapshot_id.to_string(),
                file_path: path.clone(),
                change_type: ChangeType::Added,
                content_hash: Some(state.content_hash.clone()),
                previous_hash: None,
                size: state.size,
            }),
        }
    }

    for (path, old) in prior {
        if !current.contains_key(path) {
            changes.push(FileChange {
                snapshot_id: snapshot_id.to_string(),
                file_path: path.clone(),
                change_type: ChangeType::Deleted,
                content_hash: None,
                previous_hash: Some(old.content_hash.clone()),
                size: old.size,
            });
        }
    }

    changes.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    changes
}
