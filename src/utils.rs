//! Utility functions for rewind
//!
//! File hashing, metadata extraction, path normalization and atomic writes
//! shared by the scanner, the content store and the rollback engine.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{hash_file_content, path_to_key, format_bytes};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let file_hash = hash_file_content(Path::new("example.txt"))?;
//! assert_eq!(file_hash.len(), 64);
//!
//! assert_eq!(path_to_key(Path::new("src/main.rs")), "src/main.rs");
//! println!("Size: {}", format_bytes(1536)); // "1.50 KB"
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RewindError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::trace;

/// Size of the read buffer used while hashing files
const HASH_BUFFER_SIZE: usize = 8192;

/// Hash a file's content using SHA-256
///
/// Reads the file in 8KB chunks, so memory use does not depend on file size.
///
/// # Errors
///
/// - [`RewindError::Io`] if the file cannot be read
pub fn hash_file_content(path: &Path) -> Result<String> {
    hash_file_with_deadline(path, None)
}

/// Hash a file's content, giving up once `deadline` passes
///
/// The deadline is checked between chunks, so a file that blocks inside a
/// single read is only interrupted once that read returns.
///
/// # Arguments
///
/// * `path` - Path to the file to hash
/// * `deadline` - Point in time after which hashing is abandoned, with the
///   limit in milliseconds used for the error
///
/// # Errors
///
/// - [`RewindError::Io`] if the file cannot be read
/// - [`RewindError::Timeout`] if the deadline passes before the end of the file
pub fn hash_file_with_deadline(path: &Path, deadline: Option<(Instant, u64)>) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        if let Some((deadline, limit_ms)) = deadline {
            if Instant::now() > deadline {
                return Err(RewindError::Timeout {
                    operation: format!("hashing {}", path.display()),
                    limit_ms,
                });
            }
        }

        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
///
/// Returns the hash as a 64-character lowercase hexadecimal string.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether a string is a well-formed content hash
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// What a directory entry is, as seen without following links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
    /// Directories, sockets, fifos and devices
    Other,
}

/// The parts of an entry's metadata that snapshots record
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub kind: EntryKind,
    pub size: u64,
    /// Mode bits, masked to `0o7777`
    pub mode: u32,
    pub modified: DateTime<Utc>,
}

impl EntryStat {
    pub fn is_regular_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Stat `path` without following symbolic links
///
/// # Errors
///
/// - [`RewindError::Io`] if the entry doesn't exist or cannot be accessed
pub fn stat_entry(path: &Path) -> Result<EntryStat> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    Ok(EntryStat {
        kind,
        size: metadata.len(),
        mode: mode_bits(&metadata),
        modified: DateTime::<Utc>::from(metadata.modified()?),
    })
}

#[cfg(unix)]
fn mode_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Windows only knows the read-only flag
#[cfg(windows)]
fn mode_bits(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode & 0o7777);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the read-only flag can be expressed.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly((mode & 0o200) == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove empty parent directories of `path`, stopping at `stop_at`
pub fn remove_empty_parents(path: &Path, stop_at: &Path) -> Result<()> {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        if !remove_dir_if_empty(dir)? {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links in `base` are preserved,
/// falling back to canonicalization.
///
/// # Errors
///
/// - [`RewindError::InvalidPath`] if the path is not under the base path
/// - [`RewindError::Io`] if canonicalization fails (fallback case only)
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| RewindError::InvalidPath(path.to_path_buf()))
}

/// Validate and normalize a project-relative path
///
/// Strips `.` components and rejects absolute paths and `..` components, so a
/// normalized path can never address anything outside the project root.
///
/// # Errors
///
/// - [`RewindError::InvalidPath`] for absolute, escaping or empty paths
pub fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RewindError::InvalidPath(path.to_path_buf()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(RewindError::InvalidPath(path.to_path_buf()));
    }
    Ok(normalized)
}

/// Key under which a relative path is stored in the index
///
/// Always uses `/` as separator so an index is portable across platforms.
pub fn path_to_key(path: &Path) -> String {
    let mut key = String::new();
    for (i, component) in path.components().enumerate() {
        if i > 0 {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

/// Inverse of [`path_to_key`]
pub fn key_to_path(key: &str) -> PathBuf {
    key.split('/').collect()
}

/// Human-readable size with binary units, e.g. `1.50 KB`
///
/// ```rust
/// use rewind::utils::format_bytes;
///
/// assert_eq!(format_bytes(900), "900 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Atomic file write (write to temp file then rename)
///
/// The temporary file lives in the destination directory so the final
/// rename never crosses a filesystem boundary. Missing parent directories
/// are created.
///
/// # Errors
///
/// - [`RewindError::Io`] if writing or renaming fails
/// - [`RewindError::InvalidPath`] if `path` has no parent directory
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RewindError::InvalidPath(path.to_path_buf()))?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".rewind-tmp-")
        .tempfile_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_data()?;
    temp.persist(path).map_err(|e| RewindError::from(e.error))?;

    Ok(())
}
