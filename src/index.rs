//! Transactional metadata index
//!
//! The index is a SQLite database (`index.db` inside the storage directory)
//! holding everything about a snapshot except file content: its metadata and
//! tags, the per-file change list, the full manifest of file states, and
//! bookmarks.
//!
//! ## Schema
//!
//! | table            | key                       | references                     |
//! |------------------|---------------------------|--------------------------------|
//! | `snapshots`      | `id`                      | `parent_snapshot -> snapshots` |
//! | `snapshot_tags`  | `(snapshot_id, tag)`      | cascade on snapshot delete     |
//! | `file_changes`   | autoincrement             | cascade on snapshot delete     |
//! | `file_states`    | `(snapshot_id, path)`     | cascade on snapshot delete     |
//! | `bookmarks`      | `snapshot_id`             | cascade on snapshot delete     |
//!
//! The `blob_refs` view unions every content hash referenced by a manifest or
//! a change record. A blob is reclaimable exactly when it no longer appears in
//! that view.
//!
//! Foreign keys are enforced, so a change row naming a snapshot that does not
//! exist aborts the surrounding transaction with
//! [`RewindError::IndexIntegrity`].

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSetBuilder};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::collections::{HashSet, HashSetExt};
use crate::error::{Result, RewindError};
use crate::types::{
    Bookmark, ChangeType, FileChange, FileState, SnapshotFilter, SnapshotId, SnapshotMetadata,
};
use crate::utils::{key_to_path, path_to_key};

/// File name of the index database inside the storage directory
pub const INDEX_FILE_NAME: &str = "index.db";

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_info (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    timestamp_us INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    parent_snapshot TEXT REFERENCES snapshots(id),
    files_affected INTEGER NOT NULL,
    total_size INTEGER NOT NULL,
    compression_ratio REAL NOT NULL,
    affected_files TEXT
);

CREATE TABLE IF NOT EXISTS snapshot_tags (
    snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, tag)
);

CREATE TABLE IF NOT EXISTS file_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    change_type TEXT NOT NULL CHECK (change_type IN ('added', 'modified', 'deleted')),
    content_hash TEXT,
    previous_hash TEXT,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_states (
    snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    modified_ns INTEGER NOT NULL,
    permissions INTEGER NOT NULL,
    PRIMARY KEY (snapshot_id, path)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS bookmarks (
    snapshot_id TEXT PRIMARY KEY REFERENCES snapshots(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp_us, id);
CREATE INDEX IF NOT EXISTS idx_snapshots_parent ON snapshots(parent_snapshot);
CREATE INDEX IF NOT EXISTS idx_changes_snapshot ON file_changes(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_changes_content ON file_changes(content_hash);
CREATE INDEX IF NOT EXISTS idx_changes_previous ON file_changes(previous_hash);
CREATE INDEX IF NOT EXISTS idx_states_hash ON file_states(content_hash);

CREATE VIEW IF NOT EXISTS blob_refs(snapshot_id, hash) AS
    SELECT snapshot_id, content_hash FROM file_states
    UNION ALL
    SELECT snapshot_id, content_hash FROM file_changes WHERE content_hash IS NOT NULL
    UNION ALL
    SELECT snapshot_id, previous_hash FROM file_changes WHERE previous_hash IS NOT NULL;
";

const SELECT_SNAPSHOT: &str = "
SELECT s.id, s.timestamp_us, s.action_type, s.description, s.parent_snapshot,
       s.files_affected, s.total_size, s.compression_ratio, s.affected_files,
       b.name, b.description, b.created_at_us
FROM snapshots s
LEFT JOIN bookmarks b ON b.snapshot_id = s.id";

/// Row counts and on-disk size of the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of snapshots
    pub snapshot_count: usize,
    /// Number of change rows across all snapshots
    pub file_change_count: usize,
    /// Number of manifest rows across all snapshots
    pub file_state_count: usize,
    /// Number of bookmarks
    pub bookmark_count: usize,
    /// Number of distinct blobs referenced by any snapshot
    pub referenced_blob_count: usize,
    /// Size of the database file in bytes (0 for in-memory indexes)
    pub db_size_bytes: u64,
}

/// SQLite-backed snapshot metadata index
///
/// A single connection is shared behind a mutex; every multi-row write runs
/// in one transaction so readers never observe a half-recorded snapshot.
pub struct MetadataIndex {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex").field("path", &self.path).finish()
    }
}

impl MetadataIndex {
    /// Open (or create) the index database at `path`
    ///
    /// # Errors
    ///
    /// - [`RewindError::Index`] if the database cannot be opened
    /// - [`RewindError::InvalidConfiguration`] if the schema was written by a
    ///   newer version
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        trace!("Index journal mode: {}", journal);

        let index = Self::with_connection(conn, Some(path.to_path_buf()))?;
        info!("Opened metadata index at {:?}", path);
        Ok(index)
    }

    /// Open a private in-memory index
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Path of the database file, `None` for in-memory indexes
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a snapshot with its change list and manifest
    ///
    /// All rows are written in one transaction. Any constraint failure (a
    /// duplicate id, a change row pointing at an unknown snapshot) rolls the
    /// whole snapshot back.
    ///
    /// # Errors
    ///
    /// - [`RewindError::IndexIntegrity`] on any constraint violation
    pub fn record_snapshot(
        &self,
        metadata: &SnapshotMetadata,
        changes: &[FileChange],
        states: &[FileState],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let affected_files = metadata
            .affected_files
            .as_ref()
            .map(|files| {
                let keys: Vec<String> = files.iter().map(|p| path_to_key(p)).collect();
                serde_json::to_string(&keys)
            })
            .transpose()?;

        tx.execute(
            "INSERT INTO snapshots (id, timestamp_us, action_type, description, parent_snapshot,
                                    files_affected, total_size, compression_ratio, affected_files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                metadata.id,
                metadata.timestamp.timestamp_micros(),
                metadata.action_type,
                metadata.description,
                metadata.parent_snapshot,
                to_i64(metadata.files_affected as u64),
                to_i64(metadata.total_size),
                metadata.compression_ratio,
                affected_files,
            ],
        )?;

        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO snapshot_tags (snapshot_id, tag) VALUES (?1, ?2)")?;
            for tag in &metadata.tags {
                stmt.execute(params![metadata.id, tag])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_changes (snapshot_id, file_path, change_type, content_hash, previous_hash, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for change in changes {
                stmt.execute(params![
                    change.snapshot_id,
                    path_to_key(&change.file_path),
                    change.change_type.as_str(),
                    change.content_hash,
                    change.previous_hash,
                    to_i64(change.size),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_states (snapshot_id, path, content_hash, size, modified_ns, permissions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for state in states.iter().filter(|s| s.exists) {
                stmt.execute(params![
                    metadata.id,
                    path_to_key(&state.path),
                    state.content_hash,
                    to_i64(state.size),
                    state.modified_time.timestamp_nanos_opt().unwrap_or(i64::MAX),
                    state.permissions,
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            "Recorded snapshot {} ({} changes, {} files)",
            metadata.id,
            changes.len(),
            states.len()
        );
        Ok(())
    }

    /// Whether a snapshot with this id exists
    pub fn snapshot_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        snapshot_exists(&conn, id)
    }

    /// Load a snapshot's metadata, tags and bookmark
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn get_snapshot(&self, id: &str) -> Result<SnapshotMetadata> {
        let conn = self.conn.lock();
        let sql = format!("{SELECT_SNAPSHOT} WHERE s.id = ?1");
        let metadata = conn
            .query_row(&sql, [id], metadata_from_row)
            .optional()?
            .ok_or_else(|| RewindError::SnapshotNotFound(id.to_string()))?;
        attach_tags(&conn, vec![metadata]).map(|mut v| v.remove(0))
    }

    /// The most recent snapshot, if any
    pub fn latest_snapshot(&self) -> Result<Option<SnapshotMetadata>> {
        let conn = self.conn.lock();
        let sql = format!("{SELECT_SNAPSHOT} ORDER BY s.timestamp_us DESC, s.id DESC LIMIT 1");
        let latest = conn.query_row(&sql, [], metadata_from_row).optional()?;
        match latest {
            Some(metadata) => Ok(attach_tags(&conn, vec![metadata])?.pop()),
            None => Ok(None),
        }
    }

    /// List snapshots matching `filter`, oldest first
    ///
    /// Ties on timestamp are broken by id. Tags and action types match if any
    /// listed value matches; file patterns match if any change path of the
    /// snapshot matches any pattern. The limit is applied after all filters.
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidPattern`] if a file pattern is not a valid glob
    pub fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotMetadata>> {
        let conn = self.conn.lock();

        let mut sql = format!("{SELECT_SNAPSHOT} WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = filter.since {
            sql.push_str(" AND s.timestamp_us >= ?");
            values.push(Value::Integer(since.timestamp_micros()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND s.timestamp_us <= ?");
            values.push(Value::Integer(until.timestamp_micros()));
        }
        if !filter.action_types.is_empty() {
            sql.push_str(&format!(
                " AND s.action_type IN ({})",
                placeholders(filter.action_types.len())
            ));
            values.extend(filter.action_types.iter().cloned().map(Value::Text));
        }
        if !filter.tags.is_empty() {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM snapshot_tags t WHERE t.snapshot_id = s.id AND t.tag IN ({}))",
                placeholders(filter.tags.len())
            ));
            values.extend(filter.tags.iter().cloned().map(Value::Text));
        }
        if filter.bookmarked_only {
            sql.push_str(" AND b.snapshot_id IS NOT NULL");
        }
        sql.push_str(" ORDER BY s.timestamp_us ASC, s.id ASC");

        let mut snapshots = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), metadata_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if !filter.file_patterns.is_empty() {
            let mut builder = GlobSetBuilder::new();
            for pattern in &filter.file_patterns {
                builder.add(Glob::new(pattern)?);
            }
            let globs = builder.build()?;

            let mut stmt =
                conn.prepare_cached("SELECT file_path FROM file_changes WHERE snapshot_id = ?1")?;
            let mut kept = Vec::with_capacity(snapshots.len());
            for metadata in snapshots {
                let paths = stmt
                    .query_map([&metadata.id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if paths.iter().any(|p| globs.is_match(p)) {
                    kept.push(metadata);
                }
            }
            snapshots = kept;
        }

        if let Some(limit) = filter.limit {
            snapshots.truncate(limit);
        }

        attach_tags(&conn, snapshots)
    }

    /// Ids of every snapshot, oldest first
    pub fn snapshot_ids(&self) -> Result<Vec<SnapshotId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM snapshots ORDER BY timestamp_us ASC, id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Number of snapshots in the index
    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// The full manifest of a snapshot, sorted by path
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn file_states(&self, id: &str) -> Result<Vec<FileState>> {
        let conn = self.conn.lock();
        if !snapshot_exists(&conn, id)? {
            return Err(RewindError::SnapshotNotFound(id.to_string()));
        }
        let mut stmt = conn.prepare_cached(
            "SELECT path, content_hash, size, modified_ns, permissions
             FROM file_states WHERE snapshot_id = ?1 ORDER BY path",
        )?;
        let states = stmt
            .query_map([id], state_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    /// A single manifest entry, `None` if the file is absent from the snapshot
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn file_state(&self, id: &str, path: &Path) -> Result<Option<FileState>> {
        let conn = self.conn.lock();
        if !snapshot_exists(&conn, id)? {
            return Err(RewindError::SnapshotNotFound(id.to_string()));
        }
        let state = conn
            .query_row(
                "SELECT path, content_hash, size, modified_ns, permissions
                 FROM file_states WHERE snapshot_id = ?1 AND path = ?2",
                params![id, path_to_key(path)],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Changes recorded with a snapshot, in insertion order
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn file_changes(&self, id: &str) -> Result<Vec<FileChange>> {
        let conn = self.conn.lock();
        if !snapshot_exists(&conn, id)? {
            return Err(RewindError::SnapshotNotFound(id.to_string()));
        }
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, file_path, change_type, content_hash, previous_hash, size
             FROM file_changes WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(snapshot_id, path, change_type, content_hash, previous_hash, size)| {
                Ok(FileChange {
                    snapshot_id,
                    file_path: key_to_path(&path),
                    change_type: change_type.parse::<ChangeType>()?,
                    content_hash,
                    previous_hash,
                    size: size.max(0) as u64,
                })
            })
            .collect()
    }

    /// Delete a snapshot and return the blob hashes nothing references anymore
    ///
    /// Children of the deleted snapshot are re-parented onto its parent. The
    /// tags, changes, manifest and bookmark rows go with the snapshot. The
    /// caller owns reclaiming the returned blobs from the content store.
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn delete_snapshot(&self, id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let parent: Option<Option<String>> = tx
            .query_row(
                "SELECT parent_snapshot FROM snapshots WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(parent) = parent else {
            return Err(RewindError::SnapshotNotFound(id.to_string()));
        };

        let candidates = {
            let mut stmt =
                tx.prepare_cached("SELECT DISTINCT hash FROM blob_refs WHERE snapshot_id = ?1")?;
            let hashes = stmt
                .query_map([id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            hashes
        };

        let reparented = tx.execute(
            "UPDATE snapshots SET parent_snapshot = ?1 WHERE parent_snapshot = ?2",
            params![parent, id],
        )?;
        tx.execute("DELETE FROM snapshots WHERE id = ?1", [id])?;

        let mut unreferenced = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "SELECT EXISTS (SELECT 1 FROM file_states WHERE content_hash = ?1)
                     OR EXISTS (SELECT 1 FROM file_changes WHERE content_hash = ?1 OR previous_hash = ?1)",
            )?;
            for hash in candidates {
                let referenced: bool = stmt.query_row([&hash], |row| row.get(0))?;
                if !referenced {
                    unreferenced.push(hash);
                }
            }
        }

        tx.commit()?;
        debug!(
            "Deleted snapshot {} ({} children re-parented, {} blobs unreferenced)",
            id,
            reparented,
            unreferenced.len()
        );
        Ok(unreferenced)
    }

    /// Every blob hash referenced by any snapshot
    pub fn referenced_hashes(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT hash FROM blob_refs")?;
        let mut hashes = HashSet::new();
        for hash in stmt.query_map([], |row| row.get::<_, String>(0))? {
            hashes.insert(hash?);
        }
        Ok(hashes)
    }

    /// Hashes referenced only by snapshots in `ids`
    ///
    /// These are the blobs that deleting exactly that set would reclaim.
    pub fn hashes_exclusive_to(&self, ids: &[SnapshotId]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let marks = placeholders(ids.len());
        let sql = format!(
            "SELECT DISTINCT hash FROM blob_refs WHERE snapshot_id IN ({marks})
             AND hash NOT IN (SELECT hash FROM blob_refs WHERE snapshot_id NOT IN ({marks}))"
        );
        let mut stmt = conn.prepare(&sql)?;
        let hashes = stmt
            .query_map(params_from_iter(ids.iter().chain(ids.iter())), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    /// Bookmark a snapshot, replacing any bookmark it already has
    ///
    /// # Errors
    ///
    /// - [`RewindError::SnapshotNotFound`] if no such snapshot exists
    pub fn add_bookmark(&self, id: &str, name: &str, description: &str) -> Result<Bookmark> {
        let conn = self.conn.lock();
        if !snapshot_exists(&conn, id)? {
            return Err(RewindError::SnapshotNotFound(id.to_string()));
        }

        let bookmark = Bookmark {
            snapshot_id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO bookmarks (snapshot_id, name, description, created_at_us)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(snapshot_id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 created_at_us = excluded.created_at_us",
            params![
                bookmark.snapshot_id,
                bookmark.name,
                bookmark.description,
                bookmark.created_at.timestamp_micros(),
            ],
        )?;
        debug!("Bookmarked snapshot {} as '{}'", id, name);
        Ok(bookmark)
    }

    /// Remove a snapshot's bookmark, returning whether one existed
    pub fn remove_bookmark(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM bookmarks WHERE snapshot_id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// All bookmarks, oldest snapshot first
    pub fn list_bookmarks(&self) -> Result<Vec<Bookmark>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT b.snapshot_id, b.name, b.description, b.created_at_us
             FROM bookmarks b JOIN snapshots s ON s.id = b.snapshot_id
             ORDER BY s.timestamp_us ASC, s.id ASC",
        )?;
        let bookmarks = stmt
            .query_map([], |row| {
                Ok(Bookmark {
                    snapshot_id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: micros_to_datetime(3, row.get(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bookmarks)
    }

    /// Ids of all bookmarked snapshots
    pub fn bookmarked_ids(&self) -> Result<HashSet<SnapshotId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT snapshot_id FROM bookmarks")?;
        let mut ids = HashSet::new();
        for id in stmt.query_map([], |row| row.get::<_, String>(0))? {
            ids.insert(id?);
        }
        Ok(ids)
    }

    /// Rows violating a foreign key, as reported by SQLite
    pub fn foreign_key_violations(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while rows.next()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Row counts and database size
    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as usize)
        };

        let db_size_bytes = match &self.path {
            Some(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            None => 0,
        };

        Ok(IndexStats {
            snapshot_count: count("SELECT COUNT(*) FROM snapshots")?,
            file_change_count: count("SELECT COUNT(*) FROM file_changes")?,
            file_state_count: count("SELECT COUNT(*) FROM file_states")?,
            bookmark_count: count("SELECT COUNT(*) FROM bookmarks")?,
            referenced_blob_count: count("SELECT COUNT(DISTINCT hash) FROM blob_refs")?,
            db_size_bytes,
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_info", [], |row| row.get(0))
        .optional()?
        .flatten();
    match version {
        None => {
            conn.execute("INSERT INTO schema_info (version) VALUES (?1)", [SCHEMA_VERSION])?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(RewindError::InvalidConfiguration(format!(
                "index schema version {} is newer than supported version {}",
                v, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

fn snapshot_exists(conn: &Connection, id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM snapshots WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn attach_tags(conn: &Connection, mut snapshots: Vec<SnapshotMetadata>) -> Result<Vec<SnapshotMetadata>> {
    let mut stmt = conn.prepare_cached("SELECT tag FROM snapshot_tags WHERE snapshot_id = ?1")?;
    for metadata in &mut snapshots {
        for tag in stmt.query_map([&metadata.id], |row| row.get::<_, String>(0))? {
            metadata.tags.insert(tag?);
        }
    }
    Ok(snapshots)
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotMetadata> {
    let id: String = row.get(0)?;
    let affected_files = row
        .get::<_, Option<String>>(8)?
        .map(|json| {
            serde_json::from_str::<Vec<String>>(&json)
                .map(|keys| keys.iter().map(|k| key_to_path(k)).collect::<Vec<PathBuf>>())
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))
        })
        .transpose()?;

    let bookmark = match row.get::<_, Option<String>>(9)? {
        Some(name) => Some(Bookmark {
            snapshot_id: id.clone(),
            name,
            description: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            created_at: micros_to_datetime(11, row.get::<_, Option<i64>>(11)?.unwrap_or(0))?,
        }),
        None => None,
    };

    Ok(SnapshotMetadata {
        id,
        timestamp: micros_to_datetime(1, row.get(1)?)?,
        action_type: row.get(2)?,
        description: row.get(3)?,
        tags: Default::default(),
        parent_snapshot: row.get(4)?,
        files_affected: row.get::<_, i64>(5)?.max(0) as usize,
        total_size: row.get::<_, i64>(6)?.max(0) as u64,
        compression_ratio: row.get(7)?,
        affected_files,
        bookmark,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<FileState> {
    Ok(FileState {
        path: key_to_path(&row.get::<_, String>(0)?),
        content_hash: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        modified_time: DateTime::from_timestamp_nanos(row.get(3)?),
        permissions: row.get(4)?,
        exists: true,
    })
}

fn micros_to_datetime(column: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, micros))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
