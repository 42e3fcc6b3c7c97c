//! Bounded LRU cache for lazily loaded file content
//!
//! Entries are keyed by `(snapshot id, relative path)` and hold decompressed
//! content behind an `Arc`, so a hit hands out a cheap clone. Storage is a
//! [`moka::sync::Cache`] with least-recently-used eviction, weighed in bytes.
//!
//! Both limits are expressed through the weigher: an entry weighs its length
//! but never less than `max_bytes / max_entries`, so neither the byte budget
//! nor the entry budget can be exceeded. Items larger than the per-item limit
//! are never cached at all.

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::config::PerformanceConfig;
use crate::types::SnapshotId;

type CacheKey = (SnapshotId, PathBuf);

/// Size bounds of a [`ContentCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total bytes across entries
    pub max_bytes: u64,
    /// Items above this size bypass the cache
    pub max_item_bytes: u64,
}

impl CacheLimits {
    /// Limits taken from the performance configuration
    pub fn from_config(config: &PerformanceConfig) -> Self {
        Self {
            max_entries: config.lazy_cache_max_entries,
            max_bytes: config.lazy_cache_max_mb.saturating_mul(1024 * 1024),
            max_item_bytes: config.lazy_cache_max_item_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Smallest weight an entry is charged, so the entry limit holds
    fn min_weight(&self) -> u64 {
        (self.max_bytes / self.max_entries.max(1) as u64).max(1)
    }
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self::from_config(&PerformanceConfig::default())
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently cached
    pub entries: usize,
    /// Bytes currently cached
    pub bytes: u64,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries dropped to respect the limits
    pub evictions: u64,
    /// Inserts refused because the item was too large
    pub bypassed: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0 when there were none
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe LRU over snapshot file content
pub struct ContentCache {
    limits: CacheLimits,
    entries: Cache<CacheKey, Arc<[u8]>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
    bypassed: AtomicU64,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ContentCache {
    /// Create an empty cache
    pub fn new(limits: CacheLimits) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let min_weight = limits.min_weight();
        let entries = Cache::builder()
            .max_capacity(limits.max_bytes)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_key: &CacheKey, data: &Arc<[u8]>| -> u32 {
                (data.len() as u64).max(min_weight).min(u64::from(u32::MAX)) as u32
            })
            .eviction_listener({
                let evictions = Arc::clone(&evictions);
                move |key: Arc<CacheKey>, _data, cause| {
                    if cause == RemovalCause::Size {
                        evictions.fetch_add(1, Ordering::Relaxed);
                        trace!("Evicted {}:{}", key.0, key.1.display());
                    }
                }
            })
            .build();

        Self {
            limits,
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
            bypassed: AtomicU64::new(0),
        }
    }

    /// Configured limits
    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    /// Look up content, marking it most recently used
    pub fn get(&self, snapshot_id: &str, path: &Path) -> Option<Arc<[u8]>> {
        let key = (snapshot_id.to_string(), path.to_path_buf());
        match self.entries.get(&key) {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether content for this key is cached, without touching recency
    pub fn contains(&self, snapshot_id: &str, path: &Path) -> bool {
        let key = (snapshot_id.to_string(), path.to_path_buf());
        self.entries.contains_key(&key)
    }

    /// Insert content, evicting least recently used entries as needed
    ///
    /// Returns `false` if the item exceeds the per-item limit and was not
    /// cached. Limits hold again by the time this returns.
    pub fn insert(&self, snapshot_id: &str, path: &Path, data: Arc<[u8]>) -> bool {
        let size = data.len() as u64;
        if size > self.limits.max_item_bytes
            || size > self.limits.max_bytes
            || self.limits.max_entries == 0
        {
            self.bypassed.fetch_add(1, Ordering::Relaxed);
            trace!("Not caching {} ({} bytes)", path.display(), size);
            return false;
        }

        self.entries
            .insert((snapshot_id.to_string(), path.to_path_buf()), data);
        self.entries.run_pending_tasks();
        true
    }

    /// Drop every entry belonging to a snapshot
    pub fn invalidate_snapshot(&self, snapshot_id: &str) -> usize {
        let keys: Vec<Arc<CacheKey>> = self
            .entries
            .iter()
            .filter(|(key, _)| key.0 == snapshot_id)
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.entries.invalidate(key.as_ref());
        }
        self.entries.run_pending_tasks();
        keys.len()
    }

    /// Remove all entries; counters are kept
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        let (entries, bytes) = self
            .entries
            .iter()
            .fold((0, 0), |(n, total), (_, data)| (n + 1, total + data.len() as u64));
        CacheStats {
            entries,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}
