//! The uniform replica backend interface and the per-replica manifest.
//!
//! A replica is any remote (or local) store that can hold artifacts under
//! their canonical object names and maintain a single `_state.json`
//! manifest describing its current restore head. Concrete backends live in
//! sibling modules; wire drivers for remote protocols implement the same
//! trait out of tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::Cancel;
use crate::config::RetentionConfig;
use crate::error::StreamError;
use crate::segment::{Segment, SegmentDescriptor, Snapshot, SnapshotDescriptor};

/// Object name of the per-replica manifest.
pub const STATE_OBJECT: &str = "_state.json";

/// A replica's view of its current head: the newest snapshot and the
/// contiguous segments extending it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreState {
    /// The generation this state describes. Empty when nothing was uploaded.
    pub generation: String,
    /// Descriptor of the head snapshot, if one was uploaded.
    pub snapshot: Option<SnapshotDescriptor>,
    /// Descriptors of the segments extending the snapshot, in upload order.
    pub segments: Vec<SegmentDescriptor>,
    /// Wall-clock of the last successful upload.
    pub last_uploaded: Option<DateTime<Utc>>,
}

impl RestoreState {
    /// True when the replica has never recorded an upload.
    pub fn is_empty(&self) -> bool {
        self.generation.is_empty() && self.snapshot.is_none() && self.segments.is_empty()
    }

    /// Records a snapshot upload.
    ///
    /// A generation change resets the state. The snapshot becomes the new
    /// head and previously listed segments are dropped: they are all
    /// covered by the snapshot's transaction.
    pub fn apply_snapshot(
        &mut self,
        generation: &str,
        desc: SnapshotDescriptor,
        now: DateTime<Utc>,
    ) {
        if self.generation != generation {
            *self = RestoreState {
                generation: generation.to_string(),
                ..RestoreState::default()
            };
        }
        self.snapshot = Some(desc);
        self.segments.clear();
        self.last_uploaded = Some(now);
    }

    /// Records a segment upload.
    ///
    /// A generation change resets the state before the descriptor is
    /// appended.
    pub fn apply_segment(&mut self, generation: &str, desc: SegmentDescriptor, now: DateTime<Utc>) {
        if self.generation != generation {
            *self = RestoreState {
                generation: generation.to_string(),
                ..RestoreState::default()
            };
        }
        self.segments.push(desc);
        self.last_uploaded = Some(now);
    }

    /// Checks the manifest invariants: segments strictly increasing and
    /// contiguous, all extending past the snapshot when one is present.
    pub fn validate(&self) -> Result<(), StreamError> {
        if let Some(snapshot) = &self.snapshot {
            let snapshot_tx = parse_tx_from_snapshot_name(&snapshot.name)?;
            if let Some(first) = self.segments.first() {
                if first.first_tx_id <= snapshot_tx {
                    return Err(StreamError::HeaderMismatch {
                        msg: format!(
                            "segment {} does not extend snapshot tx {}",
                            first.name, snapshot_tx
                        ),
                    });
                }
            }
        }
        for pair in self.segments.windows(2) {
            if pair[1].first_tx_id != pair[0].last_tx_id + 1 {
                return Err(StreamError::HeaderMismatch {
                    msg: format!(
                        "segment chain broken between {} and {}",
                        pair[0].name, pair[1].name
                    ),
                });
            }
        }
        for desc in &self.segments {
            if desc.first_tx_id > desc.last_tx_id {
                return Err(StreamError::HeaderMismatch {
                    msg: format!("segment {} has an inverted tx range", desc.name),
                });
            }
        }
        Ok(())
    }
}

fn parse_tx_from_snapshot_name(name: &str) -> Result<u64, StreamError> {
    let base = name.rsplit('/').next().unwrap_or(name);
    crate::segment::parse_snapshot_file_name(base).map(|(_, tx)| tx)
}

/// Uniform storage interface for replication targets.
///
/// Implementations must be safe under concurrent calls from the
/// controller's fan-out path; manifest updates are serialized internally.
/// Failures are reported as errors and never panic the commit path.
pub trait Replica: Send + Sync {
    /// Stable identifier for logs and lag accounting.
    fn name(&self) -> &str;

    /// Persists a segment and appends it to the replica manifest.
    fn put_segment(
        &self,
        cancel: &Cancel,
        generation: &str,
        segment: &Segment,
    ) -> Result<(), StreamError>;

    /// Persists a snapshot and makes it the replica manifest's head.
    fn put_snapshot(
        &self,
        cancel: &Cancel,
        generation: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StreamError>;

    /// Retrieves and decodes the referenced segment.
    fn fetch_segment(
        &self,
        cancel: &Cancel,
        generation: &str,
        desc: &SegmentDescriptor,
    ) -> Result<Segment, StreamError>;

    /// Retrieves and decodes the referenced snapshot.
    fn fetch_snapshot(
        &self,
        cancel: &Cancel,
        generation: &str,
        desc: &SnapshotDescriptor,
    ) -> Result<Snapshot, StreamError>;

    /// Applies the retention policy to stored artifacts.
    fn prune(
        &self,
        cancel: &Cancel,
        generation: &str,
        retention: &RetentionConfig,
    ) -> Result<(), StreamError>;

    /// Returns the replica's manifest, or an empty state if none exists.
    fn latest_state(&self, cancel: &Cancel) -> Result<RestoreState, StreamError>;

    /// Releases held resources (connections, handles).
    fn close(&self) -> Result<(), StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::snapshot_object_name;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap()
    }

    fn segment_desc(first: u64, last: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            name: format!("gen/segments/{last:016x}.segment"),
            first_tx_id: first,
            last_tx_id: last,
            timestamp: ts(),
            size: 1,
        }
    }

    fn snapshot_desc(tx: u64) -> SnapshotDescriptor {
        SnapshotDescriptor {
            name: snapshot_object_name("gen", &ts(), tx),
            timestamp: ts(),
            size: 1,
        }
    }

    #[test]
    fn test_empty_state() {
        let state = RestoreState::default();
        assert!(state.is_empty());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_apply_segment_appends_within_generation() {
        let mut state = RestoreState::default();
        state.apply_segment("gen", segment_desc(1, 1), ts());
        state.apply_segment("gen", segment_desc(2, 2), ts());
        assert_eq!(state.generation, "gen");
        assert_eq!(state.segments.len(), 2);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_apply_segment_resets_on_generation_change() {
        let mut state = RestoreState::default();
        state.apply_snapshot("old", snapshot_desc(3), ts());
        state.apply_segment("old", segment_desc(4, 4), ts());
        state.apply_segment("new", segment_desc(1, 1), ts());
        assert_eq!(state.generation, "new");
        assert!(state.snapshot.is_none());
        assert_eq!(state.segments.len(), 1);
    }

    #[test]
    fn test_apply_snapshot_clears_covered_segments() {
        let mut state = RestoreState::default();
        state.apply_segment("gen", segment_desc(1, 1), ts());
        state.apply_segment("gen", segment_desc(2, 2), ts());
        state.apply_snapshot("gen", snapshot_desc(2), ts());
        assert!(state.segments.is_empty());
        assert!(state.snapshot.is_some());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_chain_gap() {
        let mut state = RestoreState::default();
        state.apply_segment("gen", segment_desc(1, 1), ts());
        state.apply_segment("gen", segment_desc(3, 3), ts());
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_segment_behind_snapshot() {
        let state = RestoreState {
            generation: "gen".to_string(),
            snapshot: Some(snapshot_desc(5)),
            segments: vec![segment_desc(4, 4)],
            last_uploaded: Some(ts()),
        };
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_manifest_json_shape() {
        let state = RestoreState {
            generation: "00aa".to_string(),
            snapshot: Some(snapshot_desc(5)),
            segments: vec![segment_desc(6, 6)],
            last_uploaded: Some(ts()),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"generation\":\"00aa\""));
        assert!(json.contains("\"lastUploaded\""));
        assert!(json.contains("\"segments\""));
        let back: RestoreState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_manifest_tolerates_missing_fields() {
        let back: RestoreState = serde_json::from_str("{}").unwrap();
        assert!(back.is_empty());
    }
}
