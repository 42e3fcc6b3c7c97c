//! Blob compression for the content store
//!
//! Every stored blob starts with a 4-byte header naming its codec, so the
//! store can read blobs written with any codec or level the repository has
//! ever been configured with.
//!
//! ## Compression Strategies
//!
//! - **None**: store everything raw
//! - **Fast**: LZ4, favoring speed over ratio
//! - **Zstd**: zstd at a configurable level (1-22), the default at level 3
//! - **Adaptive**: zstd, but skip small files and already-compressed formats
//!
//! ## Format
//!
//! - `LZ4R`: LZ4 block with prepended size follows
//! - `ZSTR`: a zstd frame follows
//! - `\0\0\0\0`: uncompressed data follows
//!
//! Content that does not shrink, or is smaller than 64 bytes, is stored raw.
//!
//! ## Examples
//!
//! ```rust
//! use rewind::compression::{CompressionEngine, CompressionStrategy};
//! use std::path::Path;
//!
//! let engine = CompressionEngine::new(CompressionStrategy::Zstd { level: 3 });
//!
//! let data = b"Hello, world! ".repeat(20);
//! let compressed = engine.compress(Path::new("test.txt"), &data).unwrap();
//! assert!(compressed.len() < data.len());
//!
//! let decompressed = engine.decompress(&compressed).unwrap();
//! assert_eq!(decompressed, data);
//! ```

use crate::error::{Result, RewindError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::trace;

// Magic bytes identifying the codec of a stored blob
const LZ4_MAGIC: &[u8; 4] = b"LZ4R";
const ZSTD_MAGIC: &[u8; 4] = b"ZSTR";
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Content below this size is never compressed
const MIN_COMPRESSIBLE_SIZE: usize = 64;

/// Highest zstd level accepted by the engine
pub const MAX_ZSTD_LEVEL: i32 = 22;

/// Compression strategies
///
/// # Examples
///
/// ```rust
/// use rewind::compression::{default_skip_extensions, CompressionStrategy};
///
/// let fast = CompressionStrategy::Fast;
/// let balanced = CompressionStrategy::Zstd { level: 3 };
/// let adaptive = CompressionStrategy::Adaptive {
///     min_size: 4096,
///     skip_extensions: default_skip_extensions(),
///     level: 3,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionStrategy {
    /// No compression
    None,

    /// LZ4 compression for all eligible files
    Fast,

    /// zstd at the given level (1-22)
    Zstd {
        /// zstd compression level
        level: i32,
    },

    /// zstd, skipping small files and already-compressed formats
    Adaptive {
        /// Skip compression for files smaller than this
        min_size: usize,
        /// Skip these file extensions (already compressed)
        skip_extensions: Vec<String>,
        /// zstd compression level
        level: i32,
    },
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        CompressionStrategy::Zstd { level: 3 }
    }
}

/// Codec recorded in a blob header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Stored as-is
    Raw,
    /// LZ4 block
    Lz4,
    /// zstd frame
    Zstd,
}

impl Codec {
    /// Detect the codec from a blob header
    pub fn detect(content: &[u8]) -> Option<Codec> {
        let header = content.get(..4)?;
        if header == LZ4_MAGIC {
            Some(Codec::Lz4)
        } else if header == ZSTD_MAGIC {
            Some(Codec::Zstd)
        } else if header == RAW_MAGIC {
            Some(Codec::Raw)
        } else {
            None
        }
    }
}

/// Counters of one [`CompressionEngine`] since it was created or reset
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Blobs written with LZ4 or zstd
    pub blobs_compressed: usize,
    /// Blobs written raw, by strategy or because encoding did not shrink them
    pub blobs_stored_raw: usize,
    /// Raw bytes handed to [`CompressionEngine::compress`]
    pub bytes_in: u64,
    /// Encoded bytes produced, headers included
    pub bytes_out: u64,
    /// Time spent encoding, in milliseconds
    pub encode_time_ms: u64,
    /// Time spent decoding, in milliseconds
    pub decode_time_ms: u64,
}

impl CompressionStats {
    /// Share of input bytes that encoding removed, `0.0` before any write
    pub fn space_savings(&self) -> f64 {
        if self.bytes_in == 0 {
            return 0.0;
        }
        1.0 - self.bytes_out as f64 / self.bytes_in as f64
    }

    /// Share of blobs that were stored compressed
    pub fn compressed_fraction(&self) -> f64 {
        match self.blobs_compressed + self.blobs_stored_raw {
            0 => 0.0,
            total => self.blobs_compressed as f64 / total as f64,
        }
    }
}

/// Compression engine shared by all store writers
///
/// The engine is `Sync`; statistics sit behind a lock so parallel writers can
/// share one instance.
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: Mutex<CompressionStats>,
}

impl CompressionEngine {
    /// Create a new compression engine with the specified strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    /// Strategy in use
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Snapshot of the current statistics
    pub fn stats(&self) -> CompressionStats {
        self.stats.lock().clone()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        *self.stats.lock() = CompressionStats::default();
    }

    /// Compress content based on strategy
    ///
    /// # Arguments
    ///
    /// * `path` - Path hint used by extension-based strategies
    /// * `content` - Bytes to compress
    ///
    /// # Returns
    ///
    /// The encoded blob: a 4-byte codec header followed by the payload.
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::Compression`] if the zstd encoder fails.
    pub fn compress(&self, path: &Path, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        let codec = self.choose_codec(path, content.len());
        let payload = match codec {
            Codec::Raw => None,
            Codec::Lz4 => Some(compress_prepend_size(content)),
            Codec::Zstd => {
                let level = self.zstd_level();
                Some(zstd::encode_all(content, level).map_err(|e| {
                    RewindError::compression(format!("zstd level {} failed: {}", level, e))
                })?)
            }
        };

        let (magic, body) = match &payload {
            Some(compressed) if compressed.len() < content.len() => {
                trace!(
                    "Compressed {:?} with {:?}: {} -> {} bytes",
                    path,
                    codec,
                    content.len(),
                    compressed.len()
                );
                let magic = if codec == Codec::Lz4 { LZ4_MAGIC } else { ZSTD_MAGIC };
                (magic, compressed.as_slice())
            }
            _ => {
                trace!("Storing {:?} raw", path);
                (RAW_MAGIC, content)
            }
        };

        let mut blob = Vec::with_capacity(magic.len() + body.len());
        blob.extend_from_slice(magic);
        blob.extend_from_slice(body);

        let mut stats = self.stats.lock();
        if magic == RAW_MAGIC {
            stats.blobs_stored_raw += 1;
        } else {
            stats.blobs_compressed += 1;
        }
        stats.bytes_in += content.len() as u64;
        stats.bytes_out += blob.len() as u64;
        stats.encode_time_ms += start.elapsed().as_millis() as u64;
        Ok(blob)
    }

    /// Decompress a blob produced by any strategy
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::Decompression`] if the blob is shorter than the
    /// header, carries an unknown header, or fails to decode.
    pub fn decompress(&self, content: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();

        let codec = Codec::detect(content)
            .ok_or_else(|| RewindError::decompression("Unknown or truncated blob header"))?;
        let payload = &content[4..];

        let decoded = match codec {
            Codec::Raw => return Ok(payload.to_vec()),
            Codec::Lz4 => decompress_size_prepended(payload)
                .map_err(|e| RewindError::decompression(format!("LZ4 decompression failed: {}", e)))?,
            Codec::Zstd => zstd::decode_all(payload)
                .map_err(|e| RewindError::decompression(format!("zstd decompression failed: {}", e)))?,
        };

        self.stats.lock().decode_time_ms += start.elapsed().as_millis() as u64;
        trace!("Decompressed {} bytes to {} bytes", content.len(), decoded.len());
        Ok(decoded)
    }

    fn zstd_level(&self) -> i32 {
        match &self.strategy {
            CompressionStrategy::Zstd { level } | CompressionStrategy::Adaptive { level, .. } => {
                (*level).clamp(1, MAX_ZSTD_LEVEL)
            }
            _ => 3,
        }
    }

    /// Pick the codec for a piece of content
    fn choose_codec(&self, path: &Path, size: usize) -> Codec {
        if size < MIN_COMPRESSIBLE_SIZE {
            return Codec::Raw;
        }

        match &self.strategy {
            CompressionStrategy::None => Codec::Raw,
            CompressionStrategy::Fast => Codec::Lz4,
            CompressionStrategy::Zstd { .. } => Codec::Zstd,
            CompressionStrategy::Adaptive {
                min_size,
                skip_extensions,
                ..
            } => {
                if size < *min_size {
                    return Codec::Raw;
                }

                let skipped = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|ext| skip_extensions.iter().any(|skip| skip.eq_ignore_ascii_case(ext)))
                    .unwrap_or(false);
                if skipped {
                    Codec::Raw
                } else {
                    Codec::Zstd
                }
            }
        }
    }
}

/// Get default list of extensions to skip compression
///
/// Returns extensions of files that are typically already compressed.
pub fn default_skip_extensions() -> Vec<String> {
    vec![
        // Images
        "jpg", "jpeg", "png", "gif", "webp", "ico", "bmp",
        // Video
        "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg",
        // Audio
        "mp3", "wav", "flac", "aac", "ogg", "wma", "m4a", "opus",
        // Archives
        "zip", "rar", "7z", "tar", "gz", "bz2", "xz", "zst",
        // Already compressed
        "lz4", "lzo", "lzma", "br",
        // Other binary formats
        "pdf", "epub", "mobi",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
