//! Filesystem replica backend: a directory tree holding artifact objects
//! and the `_state.json` manifest.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use crate::cancel::Cancel;
use crate::codec;
use crate::config::{FileReplicaConfig, RetentionConfig};
use crate::error::StreamError;
use crate::replica::{Replica, RestoreState, STATE_OBJECT};
use crate::retention;
use crate::segment::{
    segment_object_name, snapshot_object_name, Segment, SegmentDescriptor, Snapshot,
    SnapshotDescriptor,
};
use crate::shadow::write_atomic;

/// A replica rooted at a local directory. Objects are files written via
/// temp + rename; the manifest is replaced in place under a mutex.
pub struct FileReplica {
    name: String,
    base: PathBuf,
    state_mu: Mutex<()>,
}

impl FileReplica {
    /// Constructs a file replica, creating its root directory.
    pub fn new(config: &FileReplicaConfig) -> Result<Self, StreamError> {
        if config.path.as_os_str().is_empty() {
            return Err(StreamError::Config {
                msg: "file replica path is empty".to_string(),
            });
        }
        fs::create_dir_all(&config.path)?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| config.path.display().to_string());
        Ok(FileReplica {
            name,
            base: config.path.clone(),
            state_mu: Mutex::new(()),
        })
    }

    /// Constructs a file replica rooted at `path` with the default name.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, StreamError> {
        FileReplica::new(&FileReplicaConfig {
            name: None,
            path: path.into(),
        })
    }

    fn object_path(&self, object_name: &str) -> PathBuf {
        let mut path = self.base.clone();
        for part in object_name.split('/') {
            path.push(part);
        }
        path
    }

    fn state_path(&self) -> PathBuf {
        self.base.join(STATE_OBJECT)
    }

    fn read_state(&self) -> Result<RestoreState, StreamError> {
        match fs::read(self.state_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(RestoreState::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_state(&self, state: &RestoreState) -> Result<(), StreamError> {
        let bytes = serde_json::to_vec(state)?;
        fs::write(self.state_path(), bytes)?;
        Ok(())
    }

    fn write_object(&self, object_name: &str, bytes: &[u8]) -> Result<(), StreamError> {
        let path = self.object_path(object_name);
        let dir = path.parent().ok_or_else(|| StreamError::NameParse {
            name: object_name.to_string(),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StreamError::NameParse {
                name: object_name.to_string(),
            })?;
        write_atomic(dir, &file_name, bytes)
    }

    fn read_object(&self, object_name: &str) -> Result<Vec<u8>, StreamError> {
        match fs::read(self.object_path(object_name)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StreamError::ObjectNotFound {
                    key: object_name.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Replica for FileReplica {
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
        let object_name = segment_object_name(generation, segment.header.tx_id);
        let encoded = codec::encode_segment(segment)?;
        self.write_object(&object_name, &encoded)?;
        debug!("replica {}: stored {}", self.name, object_name);

        let desc = SegmentDescriptor {
            name: object_name,
            first_tx_id: segment.header.parent_tx_id + 1,
            last_tx_id: segment.header.tx_id,
            timestamp: segment.header.created_at,
            size: encoded.len() as u64,
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
        let object_name = snapshot_object_name(
            generation,
            &snapshot.header.created_at,
            snapshot.header.tx_id,
        );
        let encoded = codec::encode_snapshot(snapshot)?;
        self.write_object(&object_name, &encoded)?;
        debug!("replica {}: stored {}", self.name, object_name);

        let desc = SnapshotDescriptor {
            name: object_name,
            timestamp: snapshot.header.created_at,
            size: encoded.len() as u64,
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
        let bytes = self.read_object(&desc.name)?;
        codec::decode_segment(&bytes)
    }

    fn fetch_snapshot(
        &self,
        cancel: &Cancel,
        _generation: &str,
        desc: &SnapshotDescriptor,
    ) -> Result<Snapshot, StreamError> {
        cancel.check()?;
        let bytes = self.read_object(&desc.name)?;
        codec::decode_snapshot(&bytes)
    }

    fn prune(
        &self,
        cancel: &Cancel,
        _generation: &str,
        retention: &RetentionConfig,
    ) -> Result<(), StreamError> {
        cancel.check()?;
        // The file backend prunes every generation it holds, not just the
        // active one.
        retention::prune_directory_tree(&self.base, Utc::now(), retention)
    }

    fn latest_state(&self, cancel: &Cancel) -> Result<RestoreState, StreamError> {
        cancel.check()?;
        self.read_state()
    }

    fn close(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

impl std::fmt::Debug for FileReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReplica")
            .field("name", &self.name)
            .field("base", &self.base)
            .finish()
    }
}
