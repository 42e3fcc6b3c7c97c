//! Content-addressable blob store
//!
//! Stores unique file contents keyed by their SHA-256 hash:
//!
//! - **Deduplication**: identical content is stored once, regardless of filename
//! - **Sharding**: blobs are spread across 256 subdirectories by hash prefix, so a
//!   blob is locatable without consulting the index
//! - **Atomic writes**: blobs are written to a temp file in their shard and renamed
//!   into place, so a partial blob is never visible under its final name
//! - **Verification**: every read re-hashes the decoded content
//!
//! ## Layout
//!
//! ```text
//! storage_root/
//! ├── metadata.json          # Store format marker
//! └── objects/               # Content-addressable objects (sharded)
//!     └── <prefix>/          # First 2 chars of hash
//!         └── <suffix>       # Remaining hash chars
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use rewind::compression::{CompressionEngine, CompressionStrategy};
//! use rewind::storage::ContentStore;
//! use std::path::PathBuf;
//!
//! # fn example() -> rewind::Result<()> {
//! let store = ContentStore::init_or_open(
//!     PathBuf::from("./.rewind"),
//!     CompressionEngine::new(CompressionStrategy::Zstd { level: 3 }),
//! )?;
//!
//! let hash = store.put(b"Hello, world!")?;
//! assert_eq!(store.get(&hash)?, b"Hello, world!");
//! # Ok(())
//! # }
//! ```

use crate::collections::{FastHasher, HashSet};
use crate::compression::{CompressionEngine, CompressionStats};
use crate::error::{Result, RewindError};
use crate::types::{ReclaimStats, StorageMetadata};
use crate::utils::{hash_data, is_valid_hash};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Version of the on-disk store format
const FORMAT_VERSION: u32 = 1;

/// Prefix of in-flight blob files
const TEMP_PREFIX: &str = ".tmp-";

/// Temp files older than this are left over from crashed writers
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Outcome of storing a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Content hash the blob is stored under
    pub hash: String,
    /// Size of the blob on disk
    pub stored_size: u64,
    /// Whether this call wrote the blob (false when it already existed)
    pub newly_written: bool,
}

/// Store-level statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of stored objects
    pub object_count: usize,
    /// Total size of all objects on disk
    pub total_size: u64,
}

/// Content-addressable blob store
///
/// All operations are safe to call concurrently from multiple threads and
/// processes: writes are atomic renames and reads never observe partial blobs.
pub struct ContentStore {
    /// Root directory for storage
    root: PathBuf,
    /// Compression engine applied to every blob
    compression: CompressionEngine,
    /// On-disk sizes of objects seen by this process
    object_sizes: DashMap<String, u64, FastHasher>,
    /// Store format marker
    metadata: StorageMetadata,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field("compression", self.compression.strategy())
            .field("known_objects", &self.object_sizes.len())
            .finish()
    }
}

impl ContentStore {
    /// Initialize a new store, or open it if one already exists at `root`
    ///
    /// # Errors
    ///
    /// - [`RewindError::Io`] if the directory structure cannot be created
    /// - [`RewindError::Json`] if an existing `metadata.json` is malformed
    pub fn init_or_open(root: PathBuf, compression: CompressionEngine) -> Result<Self> {
        if root.join("metadata.json").exists() {
            return Self::open(root, compression);
        }

        fs::create_dir_all(root.join("objects"))?;

        let metadata = StorageMetadata {
            format_version: FORMAT_VERSION,
            rewind_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        };
        let metadata_json = serde_json::to_string_pretty(&metadata)?;
        crate::utils::atomic_write(&root.join("metadata.json"), metadata_json.as_bytes())?;

        info!("Initialized content store at {:?}", root);

        Ok(Self {
            root,
            compression,
            object_sizes: DashMap::with_capacity_and_hasher(1000, FastHasher::default()),
            metadata,
        })
    }

    /// Open an existing store
    ///
    /// Removes temp files abandoned by crashed writers.
    ///
    /// # Errors
    ///
    /// - [`RewindError::StorageNotInitialized`] if no store exists at `root`
    /// - [`RewindError::InvalidConfiguration`] if the store was written by a
    ///   newer format version
    pub fn open(root: PathBuf, compression: CompressionEngine) -> Result<Self> {
        let metadata_path = root.join("metadata.json");
        if !metadata_path.exists() {
            return Err(RewindError::StorageNotInitialized(root));
        }

        let metadata: StorageMetadata = serde_json::from_str(&fs::read_to_string(&metadata_path)?)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(RewindError::InvalidConfiguration(format!(
                "store format version {} is newer than supported version {}",
                metadata.format_version, FORMAT_VERSION
            )));
        }
        fs::create_dir_all(root.join("objects"))?;

        let store = Self {
            root,
            compression,
            object_sizes: DashMap::with_capacity_and_hasher(1000, FastHasher::default()),
            metadata,
        };

        let removed = store.remove_stale_temp_files()?;
        if removed > 0 {
            debug!("Removed {} abandoned temp files", removed);
        }

        debug!("Opened content store at {:?}", store.root);
        Ok(store)
    }

    /// Store content and return its hash
    ///
    /// Idempotent: content that is already stored is not rewritten.
    ///
    /// # Errors
    ///
    /// - [`RewindError::DiskExhausted`] if the device is full
    /// - [`RewindError::Io`] if filesystem operations fail
    /// - [`RewindError::Compression`] if compression fails
    pub fn put(&self, content: &[u8]) -> Result<String> {
        self.store(content, Path::new("")).map(|stored| stored.hash)
    }

    /// Store content with a path hint for the compression strategy
    ///
    /// # Arguments
    ///
    /// * `content` - Raw bytes to store
    /// * `path_hint` - Original file path, used by extension-based strategies
    ///
    /// # Returns
    ///
    /// The hash, the on-disk size, and whether this call wrote the blob.
    pub fn store(&self, content: &[u8], path_hint: &Path) -> Result<StoredObject> {
        let hash = hash_data(content);
        let object_path = self.object_path_unchecked(&hash);

        if object_path.exists() {
            trace!("Object {} already stored", &hash[..8]);
            let stored_size = self.object_size(&hash)?;
            return Ok(StoredObject {
                hash,
                stored_size,
                newly_written: false,
            });
        }

        let encoded = self.compression.compress(path_hint, content)?;
        let shard_dir = self.root.join("objects").join(&hash[..2]);
        fs::create_dir_all(&shard_dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&shard_dir)?;
        temp.write_all(&encoded)?;
        temp.as_file().sync_data()?;
        // A concurrent writer of the same content may have won the race; the
        // rename then replaces identical bytes.
        temp.persist(&object_path).map_err(|e| RewindError::from(e.error))?;

        let stored_size = encoded.len() as u64;
        self.object_sizes.insert(hash.clone(), stored_size);

        trace!("Stored object {} ({} -> {} bytes)", &hash[..8], content.len(), stored_size);
        Ok(StoredObject {
            hash,
            stored_size,
            newly_written: true,
        })
    }

    /// Load object content by its hash
    ///
    /// # Errors
    ///
    /// - [`RewindError::ObjectNotFound`] if the object doesn't exist
    /// - [`RewindError::StoreCorruption`] if the blob fails to decode or its
    ///   content no longer hashes to its key
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let object_path = self
            .object_path(hash)
            .ok_or_else(|| RewindError::ObjectNotFound(hash.to_string()))?;

        let encoded = match fs::read(&object_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RewindError::ObjectNotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let content = self
            .compression
            .decompress(&encoded)
            .map_err(|e| RewindError::corruption(hash, e.to_string()))?;

        let actual = hash_data(&content);
        if actual != hash {
            return Err(RewindError::corruption(
                hash,
                format!("content hashes to {}", actual),
            ));
        }

        trace!("Loaded object {} ({} bytes)", &hash[..8], content.len());
        Ok(content)
    }

    /// Check if an object exists
    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).map(|p| p.exists()).unwrap_or(false)
    }

    /// Delete an object
    ///
    /// # Returns
    ///
    /// The number of bytes reclaimed, 0 if the object was already absent.
    pub fn delete(&self, hash: &str) -> Result<u64> {
        let Some(object_path) = self.object_path(hash) else {
            return Ok(0);
        };

        let size = match fs::metadata(&object_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&object_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        self.object_sizes.remove(hash);

        if let Some(shard) = object_path.parent() {
            crate::utils::remove_dir_if_empty(shard)?;
        }

        trace!("Deleted object {} ({} bytes)", &hash[..8], size);
        Ok(size)
    }

    /// Size of an object on disk
    pub fn object_size(&self, hash: &str) -> Result<u64> {
        if let Some(size) = self.object_sizes.get(hash) {
            return Ok(*size);
        }

        let object_path = self
            .object_path(hash)
            .ok_or_else(|| RewindError::ObjectNotFound(hash.to_string()))?;
        match fs::metadata(&object_path) {
            Ok(meta) => {
                self.object_sizes.insert(hash.to_string(), meta.len());
                Ok(meta.len())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RewindError::ObjectNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List all objects in storage
    pub fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.walk_objects()?.into_iter().map(|(hash, _)| hash).collect())
    }

    /// Total size of all objects on disk
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(self.walk_objects()?.into_iter().map(|(_, size)| size).sum())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let objects = self.walk_objects()?;
        Ok(StoreStats {
            object_count: objects.len(),
            total_size: objects.iter().map(|(_, size)| size).sum(),
        })
    }

    /// Compression statistics since this store was opened
    pub fn compression_stats(&self) -> CompressionStats {
        self.compression.stats()
    }

    /// Read and re-hash every stored object
    ///
    /// # Returns
    ///
    /// The number of objects checked and the hashes of those that failed.
    pub fn validate_integrity(&self) -> Result<(usize, Vec<String>)> {
        let mut checked = 0;
        let mut corrupted = Vec::new();

        for hash in self.list_all()? {
            checked += 1;
            match self.get(&hash) {
                Ok(_) => {}
                Err(e) if e.is_corruption() => {
                    warn!("Object {} failed verification: {}", hash, e);
                    corrupted.push(hash);
                }
                Err(RewindError::ObjectNotFound(_)) => {
                    // Deleted concurrently
                    checked -= 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((checked, corrupted))
    }

    /// Delete every object not in `referenced`
    ///
    /// # Arguments
    ///
    /// * `referenced` - Hashes that must be kept
    /// * `dry_run` - Report what would be deleted without deleting
    pub fn cleanup_orphans(&self, referenced: &HashSet<String>, dry_run: bool) -> Result<ReclaimStats> {
        let start = Instant::now();
        let mut stats = ReclaimStats::default();

        for (hash, size) in self.walk_objects()? {
            stats.blobs_scanned += 1;
            if referenced.contains(&hash) {
                continue;
            }

            if dry_run {
                stats.bytes_reclaimed += size;
            } else {
                stats.bytes_reclaimed += self.delete(&hash)?;
                stats.blobs_removed += 1;
            }
            stats.unreferenced.push(hash);
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Orphan cleanup{}: {} of {} objects unreferenced, {} bytes",
            if dry_run { " (dry run)" } else { "" },
            stats.unreferenced.len(),
            stats.blobs_scanned,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }

    /// Get storage root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get store metadata
    pub fn metadata(&self) -> &StorageMetadata {
        &self.metadata
    }

    /// Get path for an object (with sharding), `None` for malformed hashes
    pub fn object_path(&self, hash: &str) -> Option<PathBuf> {
        is_valid_hash(hash).then(|| self.object_path_unchecked(hash))
    }

    fn object_path_unchecked(&self, hash: &str) -> PathBuf {
        let (prefix, suffix) = hash.split_at(2);
        self.root.join("objects").join(prefix).join(suffix)
    }

    /// Walk the shard directories, returning `(hash, size)` for every blob
    fn walk_objects(&self) -> Result<Vec<(String, u64)>> {
        let objects_dir = self.root.join("objects");
        let mut objects = Vec::new();
        if !objects_dir.exists() {
            return Ok(objects);
        }

        for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                // Shard removed while walking
                Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let object_name = entry.file_name().to_string_lossy();
            if object_name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let Some(shard_name) = entry.path().parent().and_then(|p| p.file_name()) else {
                continue;
            };
            let hash = format!("{}{}", shard_name.to_string_lossy(), object_name);
            if !is_valid_hash(&hash) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            objects.push((hash, size));
        }

        Ok(objects)
    }

    /// Remove temp files left behind by writers that crashed mid-write
    fn remove_stale_temp_files(&self) -> Result<usize> {
        let objects_dir = self.root.join("objects");
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2).into_iter().flatten() {
            if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > STALE_TEMP_AGE)
                .unwrap_or(false);
            if stale && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}
