//! Engine configuration
//!
//! Configuration is read from `config.toml` in the storage directory. Every
//! key is optional; missing keys take their default value.
//!
//! ```toml
//! [storage]
//! max_snapshots = 100
//! cleanup_after_days = 30
//! max_disk_usage_mb = 1000
//! compression = "zstd"
//! compression_level = 3
//! cleanup_interval = "5m"
//!
//! [performance]
//! max_file_size_mb = 100
//! parallel_processing = true
//! max_workers = 4
//!
//! [scan]
//! respect_gitignore = true
//! ```

use crate::compression::{default_skip_extensions, CompressionStrategy, MAX_ZSTD_LEVEL};
use crate::error::{Result, RewindError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Name of the configuration file inside the storage directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Directories that are never scanned
pub fn default_excluded_dirs() -> Vec<String> {
    [
        ".rewind", ".git", ".svn", ".hg", "__pycache__", "node_modules", ".venv", "venv", "target", "build",
        "dist", ".idea", ".vscode",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Codec used for new blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store raw
    None,
    /// LZ4
    Lz4,
    /// zstd at `compression_level`
    Zstd,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Storage and retention settings
    pub storage: StorageConfig,
    /// Scanning and caching settings
    pub performance: PerformanceConfig,
    /// Tree walking settings
    pub scan: ScanConfig,
}

/// Storage and retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep at most this many snapshots
    pub max_snapshots: usize,
    /// Delete snapshots older than this many days
    pub cleanup_after_days: u32,
    /// Keep stored blobs under this many megabytes
    pub max_disk_usage_mb: u64,
    /// Whether new blobs are compressed
    pub compression_enabled: bool,
    /// Codec for new blobs
    pub compression: CompressionAlgorithm,
    /// zstd level (1-22)
    pub compression_level: i32,
    /// Skip compression for files with these extensions
    pub skip_compression_extensions: Vec<String>,
    /// Run retention after every snapshot and on a timer
    pub auto_cleanup: bool,
    /// Interval of the background retention timer (humantime, e.g. "5m")
    pub cleanup_interval: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 100,
            cleanup_after_days: 30,
            max_disk_usage_mb: 1000,
            compression_enabled: true,
            compression: CompressionAlgorithm::Zstd,
            compression_level: 3,
            skip_compression_extensions: default_skip_extensions(),
            auto_cleanup: true,
            cleanup_interval: "5m".to_string(),
        }
    }
}

/// Scanning and caching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Files larger than this are treated as absent (0 = unlimited)
    pub max_file_size_mb: u64,
    /// Hash files on a worker pool
    pub parallel_processing: bool,
    /// Upper bound on hashing workers
    pub max_workers: usize,
    /// Scan in parallel only above this many candidate files
    pub parallel_threshold: usize,
    /// Per-file hashing deadline in milliseconds
    pub file_timeout_ms: u64,
    /// Abort a snapshot that takes longer than this (0 = no limit)
    pub snapshot_timeout_seconds: u64,
    /// Maximum number of cached file signatures
    pub signature_cache_limit: usize,
    /// Maximum number of entries in the lazy content cache
    pub lazy_cache_max_entries: usize,
    /// Maximum total size of the lazy content cache
    pub lazy_cache_max_mb: u64,
    /// Larger items bypass the lazy content cache
    pub lazy_cache_max_item_mb: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            parallel_processing: true,
            max_workers: 4,
            parallel_threshold: 10,
            file_timeout_ms: 5000,
            snapshot_timeout_seconds: 30,
            signature_cache_limit: 10_000,
            lazy_cache_max_entries: 100,
            lazy_cache_max_mb: 64,
            lazy_cache_max_item_mb: 10,
        }
    }
}

/// Tree walking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Honor `.gitignore`, `.ignore` and global git excludes
    pub respect_gitignore: bool,
    /// Directory names pruned from every walk
    pub excluded_dirs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            excluded_dirs: default_excluded_dirs(),
        }
    }
}

/// Limits enforced by the retention manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many snapshots
    pub max_snapshots: usize,
    /// Delete snapshots older than this many days
    pub cleanup_after_days: u32,
    /// Keep stored blobs under this many megabytes
    pub max_disk_usage_mb: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        StorageConfig::default().retention_policy()
    }
}

impl RetentionPolicy {
    /// Disk limit in bytes
    pub fn max_disk_usage_bytes(&self) -> u64 {
        self.max_disk_usage_mb.saturating_mul(1024 * 1024)
    }
}

impl StorageConfig {
    /// Retention limits from this configuration
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_snapshots: self.max_snapshots,
            cleanup_after_days: self.cleanup_after_days,
            max_disk_usage_mb: self.max_disk_usage_mb,
        }
    }

    /// Compression strategy for new blobs
    pub fn compression_strategy(&self) -> CompressionStrategy {
        if !self.compression_enabled {
            return CompressionStrategy::None;
        }
        match self.compression {
            CompressionAlgorithm::None => CompressionStrategy::None,
            CompressionAlgorithm::Lz4 => CompressionStrategy::Fast,
            CompressionAlgorithm::Zstd if self.skip_compression_extensions.is_empty() => {
                CompressionStrategy::Zstd {
                    level: self.compression_level,
                }
            }
            CompressionAlgorithm::Zstd => CompressionStrategy::Adaptive {
                min_size: 0,
                skip_extensions: self.skip_compression_extensions.clone(),
                level: self.compression_level,
            },
        }
    }

    /// Parsed background retention interval
    pub fn cleanup_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.cleanup_interval).map_err(|e| {
            RewindError::InvalidConfiguration(format!(
                "cleanup_interval '{}': {}",
                self.cleanup_interval, e
            ))
        })
    }
}

impl PerformanceConfig {
    /// File size limit in bytes, `None` when unlimited
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        (self.max_file_size_mb > 0).then(|| self.max_file_size_mb.saturating_mul(1024 * 1024))
    }

    /// Snapshot deadline, `None` when unlimited
    pub fn snapshot_timeout(&self) -> Option<Duration> {
        (self.snapshot_timeout_seconds > 0).then(|| Duration::from_secs(self.snapshot_timeout_seconds))
    }
}

impl RewindConfig {
    /// Load configuration from `storage_dir/config.toml`
    ///
    /// A missing file yields the default configuration. The result is validated.
    ///
    /// # Errors
    ///
    /// - [`RewindError::ConfigParse`] if the file is not valid TOML for this schema
    /// - [`RewindError::InvalidConfiguration`] if a value is out of range
    pub fn load(storage_dir: &Path) -> Result<Self> {
        let path = storage_dir.join(CONFIG_FILE_NAME);
        let config = match fs::read_to_string(&path) {
            Ok(content) => {
                debug!("Loading configuration from {:?}", path);
                toml::from_str(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to `storage_dir/config.toml`
    pub fn save(&self, storage_dir: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        crate::utils::atomic_write(&storage_dir.join(CONFIG_FILE_NAME), content.as_bytes())
    }

    /// Check every value is in range
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::InvalidConfiguration`] naming the first bad key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(RewindError::InvalidConfiguration(msg.to_string()));

        if self.storage.max_snapshots == 0 {
            return invalid("storage.max_snapshots must be greater than 0");
        }
        if self.storage.cleanup_after_days == 0 {
            return invalid("storage.cleanup_after_days must be greater than 0");
        }
        if self.storage.max_disk_usage_mb == 0 {
            return invalid("storage.max_disk_usage_mb must be greater than 0");
        }
        if !(1..=MAX_ZSTD_LEVEL).contains(&self.storage.compression_level) {
            return invalid("storage.compression_level must be between 1 and 22");
        }
        if self.storage.cleanup_interval()?.is_zero() {
            return invalid("storage.cleanup_interval must be greater than 0");
        }
        if self.performance.max_workers == 0 {
            return invalid("performance.max_workers must be greater than 0");
        }
        if self.performance.file_timeout_ms == 0 {
            return invalid("performance.file_timeout_ms must be greater than 0");
        }
        if self.performance.lazy_cache_max_entries == 0 {
            return invalid("performance.lazy_cache_max_entries must be greater than 0");
        }
        if self.performance.signature_cache_limit == 0 {
            return invalid("performance.signature_cache_limit must be greater than 0");
        }

        Ok(())
    }
}
