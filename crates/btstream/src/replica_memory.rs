//! In-memory replica backend with object-storage semantics.
//!
//! Behaves like a remote object store: a flat key space, list-by-prefix,
//! replace-on-put, and a stable not-found sentinel. Remote wire drivers
//! share these semantics, so this backend doubles as their in-core stand-in
//! for fan-out, manifest, and retention behavior. It also carries an
//! injectable put-failure switch for exercising partial replication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;

use crate::cancel::Cancel;
use crate::codec;
use crate::config::{MemoryReplicaConfig, RetentionConfig};
use crate::error::StreamError;
use crate::replica::{Replica, RestoreState, STATE_OBJECT};
use crate::retention::{self, SnapshotCandidate};
use crate::segment::{
    parse_segment_file_name, parse_snapshot_file_name, segment_object_name, snapshot_object_name,
    Segment, SegmentDescriptor, Snapshot, SnapshotDescriptor,
};

/// An object-store replica held entirely in memory.
pub struct MemoryReplica {
    name: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    state_mu: Mutex<()>,
    fail_puts: AtomicBool,
}

impl MemoryReplica {
    /// Creates an empty replica with the given display name.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryReplica {
            name: name.into(),
            objects: Mutex::new(BTreeMap::new()),
            state_mu: Mutex::new(()),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Creates a replica from its configuration block.
    pub fn from_config(config: &MemoryReplicaConfig) -> Self {
        MemoryReplica::new(config.name.clone().unwrap_or_else(|| "memory".to_string()))
    }

    /// Makes subsequent puts fail (or succeed again) with a reported error.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of stored objects, the manifest included.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// True when an object exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    fn check_put(&self) -> Result<(), StreamError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StreamError::Replica {
                name: self.name.clone(),
                msg: "injected put failure".to_string(),
            });
        }
        Ok(())
    }

    fn put_object(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, StreamError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::ObjectNotFound {
                key: key.to_string(),
            })
    }

    fn delete_object(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    fn list_objects(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn read_state(&self) -> Result<RestoreState, StreamError> {
        match self.get_object(STATE_OBJECT) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(StreamError::ObjectNotFound { .. }) => Ok(RestoreState::default()),
            Err(err) => Err(err),
        }
    }

    fn write_state(&self, state: &RestoreState) -> Result<(), StreamError> {
        let bytes = serde_json::to_vec(state)?;
        self.put_object(STATE_OBJECT, bytes);
        Ok(())
    }
}

impl Replica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn put_segment(
        &self,
        cancel: &Cancel,
        generation: &str,
        segment: &Segment,
    ) -> Result<(), StreamError> {
        cancel.check()?;
        self.check_put()?;
        let object_name = segment_object_name(generation, segment.header.tx_id);
        let encoded = codec::encode_segment(segment)?;
        let size = encoded.len() as u64;
        self.put_object(&object_name, encoded);

        let desc = SegmentDescriptor {
            name: object_name,
            first_tx_id: segment.header.parent_tx_id + 1,
            last_tx_id: segment.header.tx_id,
            timestamp: segment.header.created_at,
            size,
        };
        let _guard = self.state_mu.lock().unwrap();
        let mut state = self.read_state()?;
        state.apply_segment(generation, desc, Utc::now());
        self.write_state(&state)
    }

    fn put_snapshot(
        &self,
        cancel: &Cancel,
        generation: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StreamError> {
        cancel.check()?;
        self.check_put()?;
        let object_name = snapshot_object_name(
            generation,
            &snapshot.header.created_at,
            snapshot.header.tx_id,
        );
        let encoded = codec::encode_snapshot(snapshot)?;
        let size = encoded.len() as u64;
        self.put_object(&object_name, encoded);

        let desc = SnapshotDescriptor {
            name: object_name,
            timestamp: snapshot.header.created_at,
            size,
        };
        let _guard = self.state_mu.lock().unwrap();
        let mut state = self.read_state()?;
        state.apply_snapshot(generation, desc, Utc::now());
        self.write_state(&state)
    }

    fn fetch_segment(
        &self,
        cancel: &Cancel,
        _generation: &str,
        desc: &SegmentDescriptor,
    ) -> Result<Segment, StreamError> {
        cancel.check()?;
        let bytes = self.get_object(&desc.name)?;
        codec::decode_segment(&bytes)
    }

    fn fetch_snapshot(
        &self,
        cancel: &Cancel,
        _generation: &str,
        desc: &SnapshotDescriptor,
    ) -> Result<Snapshot, StreamError> {
        cancel.check()?;
        let bytes = self.get_object(&desc.name)?;
        codec::decode_snapshot(&bytes)
    }

    fn prune(
        &self,
        cancel: &Cancel,
        generation: &str,
        retention_cfg: &RetentionConfig,
    ) -> Result<(), StreamError> {
        cancel.check()?;
        if generation.is_empty() {
            return Ok(());
        }

        let snapshot_prefix = format!("{generation}/snapshots/");
        let mut candidates = Vec::new();
        for key in self.list_objects(&snapshot_prefix) {
            let base = key.rsplit('/').next().unwrap_or(&key).to_string();
            if let Ok((created_at, tx_id)) = parse_snapshot_file_name(&base) {
                candidates.push((SnapshotCandidate { created_at, tx_id }, key));
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let plan = retention::plan_snapshots(
            Utc::now(),
            retention_cfg,
            candidates.iter().map(|(c, _)| *c).collect(),
        );
        for (candidate, key) in &candidates {
            if plan.expire.contains(candidate) {
                self.delete_object(key);
            }
        }

        let keep_tx_id = match plan.keep_tx_id() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let segment_prefix = format!("{generation}/segments/");
        for key in self.list_objects(&segment_prefix) {
            let base = key.rsplit('/').next().unwrap_or(&key).to_string();
            if let Ok(tx_id) = parse_segment_file_name(&base) {
                if retention::segment_expired(tx_id, keep_tx_id) {
                    self.delete_object(&key);
                }
            }
        }
        Ok(())
    }

    fn latest_state(&self, cancel: &Cancel) -> Result<RestoreState, StreamError> {
        cancel.check()?;
        self.read_state()
    }

    fn close(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReplica")
            .field("name", &self.name)
            .field("objects", &self.object_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CompressionSettings};
    use crate::segment::{CompressionKind, PageFrame, SegmentHeader, SnapshotHeader};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn codec() -> Codec {
        Codec::new(CompressionSettings {
            codec: CompressionKind::None,
            level: 0,
            window: 0,
        })
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 11, 0, 0).unwrap()
    }

    fn sealed_segment(tx_id: u64) -> Segment {
        let header = SegmentHeader {
            magic: String::new(),
            version: 0,
            tx_id,
            parent_tx_id: tx_id - 1,
            page_count: 0,
            page_size: 64,
            checksum: 0,
            compression: CompressionKind::None,
            compression_level: 0,
            compression_window: 0,
            created_at: ts(),
            high_water_mark: 2,
            attrs: BTreeMap::new(),
        };
        let frames = vec![PageFrame {
            id: 1,
            overflow: 0,
            data: vec![tx_id as u8; 64],
        }];
        codec().seal_segment(header, frames).unwrap()
    }

    fn sealed_snapshot_at(tx_id: u64, created_at: DateTime<Utc>) -> Snapshot {
        let header = SnapshotHeader {
            magic: String::new(),
            version: 0,
            tx_id,
            page_count: 0,
            page_size: 64,
            compression: CompressionKind::None,
            compression_level: 0,
            compression_window: 0,
            created_at,
        };
        codec().seal_snapshot(header, &[3u8; 128]).unwrap()
    }

    #[test]
    fn test_put_segment_updates_manifest() {
        let replica = MemoryReplica::new("mem");
        let cancel = Cancel::new();
        replica
            .put_segment(&cancel, "gen", &sealed_segment(2))
            .unwrap();
        assert!(replica.contains("gen/segments/0000000000000002.segment"));
        let state = replica.latest_state(&cancel).unwrap();
        assert_eq!(state.segments.len(), 1);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_put_failure_injection() {
        let replica = MemoryReplica::new("mem");
        let cancel = Cancel::new();
        replica.fail_puts(true);
        let err = replica
            .put_segment(&cancel, "gen", &sealed_segment(2))
            .unwrap_err();
        assert!(matches!(err, StreamError::Replica { .. }));
        assert_eq!(replica.object_count(), 0);

        replica.fail_puts(false);
        replica
            .put_segment(&cancel, "gen", &sealed_segment(2))
            .unwrap();
        assert_eq!(replica.object_count(), 2); // object + manifest
    }

    #[test]
    fn test_fetch_round_trip() {
        let replica = MemoryReplica::new("mem");
        let cancel = Cancel::new();
        let segment = sealed_segment(4);
        replica.put_segment(&cancel, "gen", &segment).unwrap();
        let state = replica.latest_state(&cancel).unwrap();
        let fetched = replica
            .fetch_segment(&cancel, "gen", &state.segments[0])
            .unwrap();
        assert_eq!(fetched, segment);
    }

    #[test]
    fn test_fetch_missing_object() {
        let replica = MemoryReplica::new("mem");
        let desc = SegmentDescriptor {
            name: "gen/segments/0000000000000009.segment".to_string(),
            first_tx_id: 9,
            last_tx_id: 9,
            timestamp: ts(),
            size: 0,
        };
        let err = replica
            .fetch_segment(&Cancel::new(), "gen", &desc)
            .unwrap_err();
        assert!(matches!(err, StreamError::ObjectNotFound { .. }));
    }

    #[test]
    fn test_latest_state_defaults_to_empty() {
        let replica = MemoryReplica::new("mem");
        assert!(replica.latest_state(&Cancel::new()).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_replaces_head_and_clears_segments() {
        let replica = MemoryReplica::new("mem");
        let cancel = Cancel::new();
        replica
            .put_segment(&cancel, "gen", &sealed_segment(2))
            .unwrap();
        replica
            .put_snapshot(&cancel, "gen", &sealed_snapshot_at(2, ts()))
            .unwrap();
        let state = replica.latest_state(&cancel).unwrap();
        assert!(state.snapshot.is_some());
        assert!(state.segments.is_empty());
    }

    #[test]
    fn test_prune_expires_old_snapshots_and_covered_segments() {
        let replica = MemoryReplica::new("mem");
        let cancel = Cancel::new();
        let now = Utc::now();
        replica
            .put_snapshot(&cancel, "gen", &sealed_snapshot_at(2, now - ChronoDuration::days(3)))
            .unwrap();
        replica
            .put_snapshot(&cancel, "gen", &sealed_snapshot_at(8, now))
            .unwrap();
        for tx in [3u64, 8, 9] {
            replica
                .put_segment(&cancel, "gen", &sealed_segment(tx))
                .unwrap();
        }

        let retention_cfg = RetentionConfig {
            snapshot_retention: Duration::from_secs(24 * 60 * 60),
            check_interval: Duration::from_secs(60 * 60),
        };
        replica.prune(&cancel, "gen", &retention_cfg).unwrap();

        let snapshots = replica.list_objects("gen/snapshots/");
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].ends_with("-0000000000000008.snapshot"));

        let segments = replica.list_objects("gen/segments/");
        assert_eq!(segments, vec!["gen/segments/0000000000000009.segment"]);
    }

    #[test]
    fn test_prune_empty_generation_is_noop() {
        let replica = MemoryReplica::new("mem");
        let retention_cfg = RetentionConfig::default();
        replica
            .prune(&Cancel::new(), "", &retention_cfg)
            .unwrap();
    }

    #[test]
    fn test_list_objects_prefix_scoping() {
        let replica = MemoryReplica::new("mem");
        replica.put_object("a/segments/x", vec![1]);
        replica.put_object("ab/segments/y", vec![2]);
        let keys = replica.list_objects("a/");
        assert_eq!(keys, vec!["a/segments/x"]);
    }
}
