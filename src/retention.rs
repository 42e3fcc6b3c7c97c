//! Snapshot retention
//!
//! The [`RetentionManager`] evaluates three independent limits and deletes the
//! union of their candidates:
//!
//! - **age**: snapshots older than `cleanup_after_days`
//! - **count**: the oldest snapshots beyond `max_snapshots`
//! - **disk usage**: the oldest snapshots, one at a time, until the estimated
//!   blob usage after deletion falls under `max_disk_usage_mb`
//!
//! The newest snapshot, bookmarked snapshots and snapshots pinned by a running
//! rollback are never candidates.
//!
//! Deletion runs oldest first in two phases per snapshot: the index deletes the
//! rows and reports which blobs lost their last reference, then those blobs are
//! removed from the content store. A crash between the phases leaves orphaned
//! blobs, which [`crate::SnapshotEngine::cleanup_orphans`] reclaims.
//!
//! The [`RetentionWorker`] runs a retention job on a background thread at a
//! fixed interval.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::collections::{HashMap, HashMapExt};
use crate::config::RetentionPolicy;
use crate::error::{Result, RewindError};
use crate::index::MetadataIndex;
use crate::storage::ContentStore;
use crate::types::{SnapshotId, SnapshotMetadata};

/// Limit that made a snapshot a deletion candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    /// Older than the age limit
    Age,
    /// Beyond the snapshot count limit
    Count,
    /// Needed to bring blob usage under the disk limit
    DiskUsage,
}

impl fmt::Display for RetentionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionReason::Age => f.write_str("age"),
            RetentionReason::Count => f.write_str("count"),
            RetentionReason::DiskUsage => f.write_str("disk usage"),
        }
    }
}

/// A snapshot selected for deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionCandidate {
    /// Snapshot id
    pub id: SnapshotId,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Every limit that selected it
    pub reasons: Vec<RetentionReason>,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Whether this was a preview
    pub dry_run: bool,
    /// Snapshots examined
    pub evaluated: usize,
    /// Snapshots selected for deletion, oldest first
    pub candidates: Vec<RetentionCandidate>,
    /// Snapshots actually deleted
    pub deleted: Vec<SnapshotId>,
    /// Blobs removed from the store
    pub blobs_reclaimed: usize,
    /// Bytes removed from the store
    pub bytes_reclaimed: u64,
    /// Blob usage before the pass
    pub disk_usage_before: u64,
    /// Blob usage after the pass (estimated for previews)
    pub disk_usage_after: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Applies a [`RetentionPolicy`] to a store and its index
pub struct RetentionManager {
    store: Arc<ContentStore>,
    index: Arc<MetadataIndex>,
    policy: RetentionPolicy,
    ops_lock: Arc<Mutex<()>>,
    /// Snapshots in use, with a count per holder
    pinned: Mutex<HashMap<SnapshotId, usize>>,
}

/// Keeps a snapshot out of retention until dropped
pub(crate) struct Pin<'a> {
    manager: &'a RetentionManager,
    id: SnapshotId,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        let mut pinned = self.manager.pinned.lock();
        if let Some(count) = pinned.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.id);
            }
        }
    }
}

impl fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionManager")
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetentionManager {
    /// Create a manager sharing the engine's operation lock
    pub fn new(
        store: Arc<ContentStore>,
        index: Arc<MetadataIndex>,
        policy: RetentionPolicy,
        ops_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            index,
            policy,
            ops_lock,
            pinned: Mutex::new(HashMap::new()),
        }
    }

    /// Exclude snapshot `id` from every pass until the returned guard drops
    pub(crate) fn pin(&self, id: &str) -> Pin<'_> {
        *self.pinned.lock().entry(id.to_string()).or_insert(0) += 1;
        trace!("Pinned snapshot {}", id);
        Pin {
            manager: self,
            id: id.to_string(),
        }
    }

    /// The enforced policy
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Apply the policy, serialized with every other mutating operation
    ///
    /// Idempotent: a second call without new snapshots deletes nothing.
    pub fn enforce(&self) -> Result<RetentionReport> {
        let _guard = self.ops_lock.lock();
        self.run(false)
    }

    /// Evaluate the policy without deleting anything
    pub fn preview(&self) -> Result<RetentionReport> {
        self.run(true)
    }

    /// Apply the policy; the caller must hold the operation lock
    #[instrument(skip(self))]
    pub(crate) fn run(&self, dry_run: bool) -> Result<RetentionReport> {
        let start = Instant::now();
        let snapshots = self.index.list_snapshots(&Default::default())?;
        let disk_usage_before = self.store.disk_usage()?;

        let mut report = RetentionReport {
            dry_run,
            evaluated: snapshots.len(),
            disk_usage_before,
            disk_usage_after: disk_usage_before,
            ..Default::default()
        };

        let (candidates, estimated_after) = self.plan(&snapshots, disk_usage_before)?;
        report.candidates = candidates;

        if dry_run {
            report.disk_usage_after = estimated_after;
        } else {
            for candidate in &report.candidates {
                let unreferenced = match self.index.delete_snapshot(&candidate.id) {
                    Ok(hashes) => hashes,
                    Err(RewindError::SnapshotNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                report.deleted.push(candidate.id.clone());

                for hash in unreferenced {
                    match self.store.delete(&hash) {
                        Ok(0) => {}
                        Ok(bytes) => {
                            report.blobs_reclaimed += 1;
                            report.bytes_reclaimed += bytes;
                        }
                        Err(e) => warn!("Failed to reclaim blob {}: {}", hash, e),
                    }
                }
            }
            if !report.deleted.is_empty() {
                report.disk_usage_after = self.store.disk_usage()?;
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if !dry_run && !report.deleted.is_empty() {
            info!(
                "Retention deleted {} snapshots, reclaimed {} blobs ({} bytes)",
                report.deleted.len(),
                report.blobs_reclaimed,
                report.bytes_reclaimed
            );
        } else {
            debug!(
                "Retention evaluated {} snapshots, {} candidates (dry run: {})",
                report.evaluated,
                report.candidates.len(),
                dry_run
            );
        }
        Ok(report)
    }

    /// Select candidates from an oldest-first snapshot list
    ///
    /// Returns the candidates and the estimated blob usage after deleting them.
    fn plan(
        &self,
        snapshots: &[SnapshotMetadata],
        disk_usage: u64,
    ) -> Result<(Vec<RetentionCandidate>, u64)> {
        let Some((newest, _)) = snapshots.split_last() else {
            return Ok((Vec::new(), disk_usage));
        };

        let pinned = self.pinned.lock().clone();
        let deletable: Vec<&SnapshotMetadata> = snapshots
            .iter()
            .filter(|s| s.id != newest.id && !s.is_protected() && !pinned.contains_key(&s.id))
            .collect();
        let mut reasons: Vec<Vec<RetentionReason>> = vec![Vec::new(); deletable.len()];

        if self.policy.cleanup_after_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.policy.cleanup_after_days));
            for (i, snapshot) in deletable.iter().enumerate() {
                if snapshot.timestamp < cutoff {
                    reasons[i].push(RetentionReason::Age);
                }
            }
        }

        if self.policy.max_snapshots > 0 && snapshots.len() > self.policy.max_snapshots {
            let excess = snapshots.len() - self.policy.max_snapshots;
            for reason in reasons.iter_mut().take(excess) {
                reason.push(RetentionReason::Count);
            }
        }

        let chosen_ids = |reasons: &[Vec<RetentionReason>]| -> Vec<SnapshotId> {
            deletable
                .iter()
                .zip(reasons)
                .filter(|(_, r)| !r.is_empty())
                .map(|(s, _)| s.id.clone())
                .collect()
        };

        let mut estimated = self.estimate_usage(&chosen_ids(&reasons), disk_usage)?;
        let limit = self.policy.max_disk_usage_bytes();
        if limit > 0 && estimated > limit {
            for i in 0..deletable.len() {
                if estimated <= limit {
                    break;
                }
                if reasons[i].is_empty() {
                    reasons[i].push(RetentionReason::DiskUsage);
                    estimated = self.estimate_usage(&chosen_ids(&reasons), disk_usage)?;
                }
            }
            if estimated > limit {
                warn!(
                    "Blob usage {} stays above the {} byte limit after retention",
                    estimated, limit
                );
            }
        }

        let candidates = deletable
            .into_iter()
            .zip(reasons)
            .filter(|(_, r)| !r.is_empty())
            .map(|(s, reasons)| RetentionCandidate {
                id: s.id.clone(),
                timestamp: s.timestamp,
                reasons,
            })
            .collect();
        Ok((candidates, estimated))
    }

    fn estimate_usage(&self, ids: &[SnapshotId], disk_usage: u64) -> Result<u64> {
        let mut freed = 0u64;
        for hash in self.index.hashes_exclusive_to(ids)? {
            match self.store.object_size(&hash) {
                Ok(size) => freed += size,
                Err(RewindError::ObjectNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(disk_usage.saturating_sub(freed))
    }
}

/// Background thread that runs a retention job at a fixed interval
///
/// The thread stops, and is joined, when the worker is dropped.
pub struct RetentionWorker {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl fmt::Debug for RetentionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionWorker")
            .field("interval", &self.interval)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl RetentionWorker {
    /// Spawn a worker calling `job` every `interval`
    ///
    /// # Errors
    ///
    /// - [`RewindError::Io`] if the thread cannot be spawned
    pub fn spawn<F>(interval: Duration, job: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = Arc::clone(&signal);

        let handle = std::thread::Builder::new()
            .name("rewind-retention".to_string())
            .spawn(move || {
                let (stopped, condvar) = &*thread_signal;
                loop {
                    let deadline = Instant::now() + interval;
                    let mut guard = stopped.lock();
                    while !*guard {
                        if condvar.wait_until(&mut guard, deadline).timed_out() {
                            break;
                        }
                    }
                    if *guard {
                        break;
                    }
                    drop(guard);
                    job();
                }
                debug!("Retention worker stopped");
            })?;

        debug!("Retention worker started with interval {:?}", interval);
        Ok(Self {
            signal,
            handle: Some(handle),
            interval,
        })
    }

    /// Interval between runs
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Signal the thread to stop and wait for it
    pub fn stop(&mut self) {
        {
            let (stopped, condvar) = &*self.signal;
            *stopped.lock() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Retention worker panicked");
            }
        }
    }
}

impl Drop for RetentionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
