//! Error types for the rewind library
//!
//! Errors fall into a small taxonomy that decides how far a failure travels:
//!
//! - per-file scan failures ([`RewindError::Scan`], [`RewindError::Timeout`]) are
//!   absorbed by the scanner and reported as skipped files
//! - integrity failures ([`RewindError::StoreCorruption`],
//!   [`RewindError::IndexIntegrity`]) abort the whole operation and leave prior
//!   state untouched
//! - [`RewindError::DiskExhausted`] triggers an emergency retention pass before
//!   it is surfaced to the caller

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the rewind library
pub type Result<T> = std::result::Result<T, RewindError>;

/// Main error type for all rewind operations
#[derive(Debug, Error)]
pub enum RewindError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite errors that are not integrity violations
    #[error("Index error: {0}")]
    Index(#[source] rusqlite::Error),

    /// Foreign-key, check or transaction violation in the metadata index
    #[error("Index integrity violation: {0}")]
    IndexIntegrity(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Snapshot not found in the index
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Object not found in content-addressable storage
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Stored blob failed to decode or its hash disagrees with its key
    #[error("Store corruption in object {hash}: {reason}")]
    StoreCorruption {
        /// Key the blob is stored under
        hash: String,
        /// What went wrong while reading it
        reason: String,
    },

    /// A single file could not be scanned
    #[error("Scan error at {path:?}: {reason}")]
    Scan {
        /// Path of the file
        path: PathBuf,
        /// Failure description
        reason: String,
    },

    /// An operation ran past its deadline
    #[error("Timeout: {operation} exceeded {limit_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Configured limit
        limit_ms: u64,
    },

    /// The storage device is full
    #[error("Disk exhausted: {0}")]
    DiskExhausted(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Restoring files failed; applied changes were undone
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Glob pattern parsing error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Path that cannot be stored or restored (absolute, escaping, non UTF-8)
    #[error("Invalid path: {0:?}")]
    InvalidPath(PathBuf),

    /// Directory walking error from the ignore crate
    #[error("Walk error: {0}")]
    Walk(#[from] ignore::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RewindError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            RewindError::DiskExhausted(err.to_string())
        } else {
            RewindError::Io(err)
        }
    }
}

impl From<rusqlite::Error> for RewindError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, msg)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                RewindError::IndexIntegrity(
                    msg.clone().unwrap_or_else(|| failure.to_string()),
                )
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::DiskFull =>
            {
                RewindError::DiskExhausted(err.to_string())
            }
            _ => RewindError::Index(err),
        }
    }
}

impl From<globset::Error> for RewindError {
    fn from(err: globset::Error) -> Self {
        RewindError::InvalidPattern(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for RewindError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        RewindError::ThreadPool(err.to_string())
    }
}

impl RewindError {
    /// Create a corruption error for a stored object
    pub fn corruption(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        RewindError::StoreCorruption {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Create a per-file scan error
    pub fn scan(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RewindError::Scan {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        RewindError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        RewindError::Decompression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RewindError::Internal(msg.into())
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors affect a single file or can succeed on retry once
    /// space has been reclaimed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RewindError::Scan { .. } | RewindError::Timeout { .. } | RewindError::DiskExhausted(_)
        )
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RewindError::StoreCorruption { .. } | RewindError::IndexIntegrity(_)
        )
    }

    /// Check if this error means the requested item does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RewindError::SnapshotNotFound(_) | RewindError::ObjectNotFound(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RewindError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' not found. Use 'rewind list' to see available snapshots.", id)
            }
            RewindError::StoreCorruption { hash, .. } => {
                format!(
                    "Stored object {} is corrupted. Run 'rewind verify' to check the whole store.",
                    hash
                )
            }
            RewindError::DiskExhausted(_) => {
                "The disk is full and retention could not free enough space. \
                 Lower max_snapshots or remove large files from the project."
                    .to_string()
            }
            RewindError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'rewind init' first.", path)
            }
            RewindError::InvalidConfiguration(msg) => {
                format!("Invalid configuration: {}. Check config.toml in the storage directory.", msg)
            }
            _ => self.to_string(),
        }
    }
}
