//! Retention policy evaluation: which snapshots stay, which expire, and
//! which segments they take with them.
//!
//! The decision logic is pure and shared by every target (shadow log, file
//! replica, memory replica). A generation always keeps its newest snapshot,
//! and segments survive only while a kept snapshot still needs them.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::config::RetentionConfig;
use crate::error::StreamError;
use crate::segment::{parse_segment_file_name, parse_snapshot_file_name};

/// A snapshot considered for retention, identified by creation time and
/// transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCandidate {
    /// Snapshot creation time.
    pub created_at: DateTime<Utc>,
    /// Snapshot transaction id.
    pub tx_id: u64,
}

/// The outcome of evaluating the policy over one generation's snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Snapshots to keep, newest first.
    pub keep: Vec<SnapshotCandidate>,
    /// Snapshots to delete.
    pub expire: Vec<SnapshotCandidate>,
}

impl RetentionPlan {
    /// Transaction id of the oldest kept snapshot.
    ///
    /// Segments at or below this id are covered by a kept snapshot and may
    /// be deleted.
    pub fn keep_tx_id(&self) -> Option<u64> {
        self.keep.last().map(|c| c.tx_id)
    }
}

/// Evaluates the retention policy over one generation's snapshots.
///
/// Snapshots newer than `now - snapshot_retention` are kept; the newest
/// snapshot is kept unconditionally. When two snapshots share a timestamp
/// the one with the larger transaction id counts as newer. A zero retention
/// keeps everything (the policy is unset).
pub fn plan_snapshots(
    now: DateTime<Utc>,
    retention: &RetentionConfig,
    mut candidates: Vec<SnapshotCandidate>,
) -> RetentionPlan {
    candidates.sort_by(|a, b| (b.created_at, b.tx_id).cmp(&(a.created_at, a.tx_id)));

    if retention.snapshot_retention.is_zero() {
        return RetentionPlan {
            keep: candidates,
            expire: Vec::new(),
        };
    }

    let cutoff = now
        - ChronoDuration::from_std(retention.snapshot_retention)
            .unwrap_or_else(|_| ChronoDuration::MAX);

    let mut plan = RetentionPlan::default();
    for candidate in candidates {
        if candidate.created_at > cutoff || plan.keep.is_empty() {
            plan.keep.push(candidate);
        } else {
            plan.expire.push(candidate);
        }
    }
    plan
}

/// True when a segment is covered by the oldest kept snapshot.
pub fn segment_expired(tx_id: u64, keep_tx_id: u64) -> bool {
    tx_id <= keep_tx_id
}

/// Prunes every generation directory under `root`.
///
/// Used by directory-tree targets (the shadow log and the file replica).
/// Deletion failures are logged and pruning continues; the first error is
/// returned at the end.
pub fn prune_directory_tree(
    root: &Path,
    now: DateTime<Utc>,
    retention: &RetentionConfig,
) -> Result<(), StreamError> {
    let mut first_err = None;
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Err(err) = prune_generation_dir(&entry.path(), now, retention) {
            warn!(
                "retention: prune of {} failed: {}",
                entry.path().display(),
                err
            );
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Prunes one generation directory (`<gen>/snapshots`, `<gen>/segments`).
pub fn prune_generation_dir(
    dir: &Path,
    now: DateTime<Utc>,
    retention: &RetentionConfig,
) -> Result<(), StreamError> {
    let snap_dir = dir.join("snapshots");
    let mut candidates = Vec::new();
    for entry in read_dir_or_empty(&snap_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok((created_at, tx_id)) = parse_snapshot_file_name(&name) {
            candidates.push((SnapshotCandidate { created_at, tx_id }, entry.path()));
        }
    }
    if candidates.is_empty() {
        return Ok(());
    }

    let plan = plan_snapshots(
        now,
        retention,
        candidates.iter().map(|(c, _)| *c).collect(),
    );
    let expired: HashSet<(DateTime<Utc>, u64)> = plan
        .expire
        .iter()
        .map(|c| (c.created_at, c.tx_id))
        .collect();

    let mut first_err = None;
    for (candidate, path) in &candidates {
        if expired.contains(&(candidate.created_at, candidate.tx_id)) {
            if let Err(err) = fs::remove_file(path) {
                warn!("retention: remove {} failed: {}", path.display(), err);
                first_err.get_or_insert(StreamError::from(err));
            }
        }
    }

    let keep_tx_id = match plan.keep_tx_id() {
        Some(tx) => tx,
        None => return first_err.map_or(Ok(()), Err),
    };

    let seg_dir = dir.join("segments");
    for entry in read_dir_or_empty(&seg_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(tx_id) = parse_segment_file_name(&name) {
            if segment_expired(tx_id, keep_tx_id) {
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(
                        "retention: remove {} failed: {}",
                        entry.path().display(),
                        err
                    );
                    first_err.get_or_insert(StreamError::from(err));
                }
            }
        }
    }

    first_err.map_or(Ok(()), Err)
}

fn read_dir_or_empty(
    dir: &Path,
) -> Result<Vec<Result<fs::DirEntry, std::io::Error>>, StreamError> {
    match fs::read_dir(dir) {
        Ok(iter) => Ok(iter.collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}
