//! The local shadow log: durable on-disk staging of artifacts before they
//! reach any replica.
//!
//! Layout: `<root>/<generation>/segments/<txid hex16>.segment` and
//! `<root>/<generation>/snapshots/<rfc3339nano>-<txid hex16>.snapshot`.
//! Writes are atomic (temp file + rename) and fsynced, so a crash never
//! leaves a half-written artifact under a canonical name.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::codec;
use crate::error::StreamError;
use crate::segment::{
    parse_segment_file_name, parse_snapshot_file_name, segment_file_name, snapshot_file_name,
    Segment, Snapshot,
};

/// A segment staged in the shadow log, identified by its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Absolute path of the artifact file.
    pub path: PathBuf,
    /// Transaction id parsed from the file name.
    pub tx_id: u64,
}

/// A snapshot staged in the shadow log, identified by its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Absolute path of the artifact file.
    pub path: PathBuf,
    /// Creation time parsed from the file name.
    pub created_at: DateTime<Utc>,
    /// Transaction id parsed from the file name.
    pub tx_id: u64,
}

/// Durable local staging for segments and snapshots, organized by
/// generation.
#[derive(Debug, Clone)]
pub struct ShadowLog {
    root: PathBuf,
}

impl ShadowLog {
    /// Opens (creating if needed) a shadow log rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(ShadowLog { root })
    }

    /// The shadow log's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(generation)
    }

    /// Stages a sealed segment, returning the path it was written to.
    pub fn put_segment(
        &self,
        generation: &str,
        segment: &Segment,
    ) -> Result<PathBuf, StreamError> {
        let dir = self.generation_dir(generation).join("segments");
        let name = segment_file_name(segment.header.tx_id);
        let encoded = codec::encode_segment(segment)?;
        write_atomic(&dir, &name, &encoded)?;
        Ok(dir.join(name))
    }

    /// Stages a sealed snapshot, returning the path it was written to.
    pub fn put_snapshot(
        &self,
        generation: &str,
        snapshot: &Snapshot,
    ) -> Result<PathBuf, StreamError> {
        let dir = self.generation_dir(generation).join("snapshots");
        let name = snapshot_file_name(&snapshot.header.created_at, snapshot.header.tx_id);
        let encoded = codec::encode_snapshot(snapshot)?;
        write_atomic(&dir, &name, &encoded)?;
        Ok(dir.join(name))
    }

    /// Enumerates generation directories, sorted lexicographically.
    pub fn list_generations(&self) -> Result<Vec<String>, StreamError> {
        let mut generations = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                generations.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        generations.sort();
        Ok(generations)
    }

    /// Enumerates a generation's segments with `tx_id > after_tx_id`,
    /// ordered by transaction id. Files with unrecognized names are skipped
    /// with a log line.
    pub fn list_segments(
        &self,
        generation: &str,
        after_tx_id: u64,
    ) -> Result<Vec<SegmentEntry>, StreamError> {
        let dir = self.generation_dir(generation).join("segments");
        let mut entries = Vec::new();
        for entry in read_dir_if_exists(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let tx_id = match parse_segment_file_name(&name) {
                Ok(tx_id) => tx_id,
                Err(_) => {
                    skip_foreign_file(&dir, &name);
                    continue;
                }
            };
            if tx_id <= after_tx_id {
                continue;
            }
            entries.push(SegmentEntry {
                path: entry.path(),
                tx_id,
            });
        }
        entries.sort_by_key(|e| e.tx_id);
        Ok(entries)
    }

    /// Enumerates a generation's snapshots, ordered by creation time (ties
    /// by transaction id). Files with unrecognized names are skipped with a
    /// log line.
    pub fn list_snapshots(&self, generation: &str) -> Result<Vec<SnapshotEntry>, StreamError> {
        let dir = self.generation_dir(generation).join("snapshots");
        let mut entries = Vec::new();
        for entry in read_dir_if_exists(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let (created_at, tx_id) = match parse_snapshot_file_name(&name) {
                Ok(parsed) => parsed,
                Err(_) => {
                    skip_foreign_file(&dir, &name);
                    continue;
                }
            };
            entries.push(SnapshotEntry {
                path: entry.path(),
                created_at,
                tx_id,
            });
        }
        entries.sort_by_key(|e| (e.created_at, e.tx_id));
        Ok(entries)
    }

    /// Loads and decodes a staged segment, cross-checking the embedded
    /// transaction id against the file name.
    pub fn load_segment(path: &Path) -> Result<Segment, StreamError> {
        let bytes = fs::read(path)?;
        let segment = codec::decode_segment(&bytes)?;
        let name = file_name_of(path)?;
        let tx_id = parse_segment_file_name(&name)?;
        if tx_id != segment.header.tx_id {
            return Err(StreamError::HeaderMismatch {
                msg: format!(
                    "segment file {} embeds tx {}",
                    name, segment.header.tx_id
                ),
            });
        }
        Ok(segment)
    }

    /// Loads and decodes a staged snapshot, cross-checking the embedded
    /// creation time and transaction id against the file name.
    pub fn load_snapshot(path: &Path) -> Result<Snapshot, StreamError> {
        let bytes = fs::read(path)?;
        let snapshot = codec::decode_snapshot(&bytes)?;
        let name = file_name_of(path)?;
        let (created_at, tx_id) = parse_snapshot_file_name(&name)?;
        if tx_id != snapshot.header.tx_id || created_at != snapshot.header.created_at {
            return Err(StreamError::HeaderMismatch {
                msg: format!(
                    "snapshot file {} embeds tx {} at {}",
                    name, snapshot.header.tx_id, snapshot.header.created_at
                ),
            });
        }
        Ok(snapshot)
    }
}

fn file_name_of(path: &Path) -> Result<String, StreamError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StreamError::NameParse {
            name: path.display().to_string(),
        })
}

fn skip_foreign_file(dir: &Path, name: &str) {
    // Temp files from in-flight writes land here too; only canonical
    // artifact names participate in enumeration.
    warn!("shadow: skipping unrecognized file {} in {}", name, dir.display());
}

fn read_dir_if_exists(dir: &Path) -> Result<Vec<Result<fs::DirEntry, std::io::Error>>, StreamError> {
    match fs::read_dir(dir) {
        Ok(iter) => {
            let mut entries: Vec<_> = iter.collect();
            entries.sort_by_key(|e| {
                e.as_ref()
                    .map(|entry| entry.file_name())
                    .unwrap_or_default()
            });
            Ok(entries)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Writes `bytes` to `<dir>/<name>` atomically: temp file, fsync, rename,
/// then fsync of the parent directory.
pub(crate) fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StreamError> {
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(".{name}.tmp"));
    let result = (|| -> Result<(), StreamError> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, dir.join(name))?;
        File::open(dir)?.sync_all()?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
