//! Crash-recovery restore: compose the freshest snapshot with its segment
//! tail and rematerialize the database file.
//!
//! The local shadow log is preferred; replicas are consulted in configured
//! order only when the shadow log holds no usable snapshot. Materialization
//! is overwrite-by-offset, so replaying a superset of segments is
//! idempotent.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::codec;
use crate::config::Config;
use crate::error::StreamError;
use crate::factory::build_replicas;
use crate::replica::Replica;
use crate::segment::{Segment, Snapshot};
use crate::shadow::ShadowLog;

/// A snapshot and the ordered segments extending it, ready to materialize.
#[derive(Debug)]
pub struct RestoreSource {
    /// The base snapshot.
    pub snapshot: Snapshot,
    /// Segments extending the snapshot; order is normalized during apply.
    pub segments: Vec<Segment>,
}

/// Restores `target` from the shadow log or, failing that, the replicas.
///
/// Returns `false` without touching anything when the target already exists
/// and is non-empty. Errors with [`StreamError::NoSnapshots`] when neither
/// source holds a snapshot.
pub fn restore_into(
    shadow: &ShadowLog,
    replicas: &[Arc<dyn Replica>],
    cancel: &Cancel,
    target: &Path,
    temp_dir: Option<&Path>,
) -> Result<bool, StreamError> {
    if target_is_populated(target)? {
        return Ok(false);
    }

    let source = match local_source(shadow)? {
        Some(source) => Some(source),
        None => replica_source(cancel, replicas)?,
    };
    let source = source.ok_or(StreamError::NoSnapshots)?;

    materialize(&source, target, temp_dir)?;
    info!(
        "restore: materialized {} from snapshot tx {} plus {} segment(s)",
        target.display(),
        source.snapshot.header.tx_id,
        source.segments.len()
    );
    Ok(true)
}

/// Restores from replicas only, using the configuration's replica set and
/// restore target. The replicas are closed before returning.
pub fn restore_standalone(config: &Config) -> Result<bool, StreamError> {
    let target = config
        .restore
        .target_path
        .clone()
        .ok_or_else(|| StreamError::Config {
            msg: "restore target path is required".to_string(),
        })?;
    if target_is_populated(&target)? {
        return Ok(false);
    }

    let cancel = Cancel::new();
    let replicas = build_replicas(config)?;
    let result = (|| {
        let source = replica_source(&cancel, &replicas)?.ok_or(StreamError::NoSnapshots)?;
        materialize(&source, &target, config.restore.temp_dir.as_deref())?;
        Ok(true)
    })();
    for replica in &replicas {
        let _ = replica.close();
    }
    result
}

fn target_is_populated(target: &Path) -> Result<bool, StreamError> {
    match fs::metadata(target) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Picks the newest decodable snapshot across all shadow generations, plus
/// that generation's tail. Corrupt artifacts are skipped with a log line.
fn local_source(shadow: &ShadowLog) -> Result<Option<RestoreSource>, StreamError> {
    let mut best: Option<(String, crate::shadow::SnapshotEntry, Snapshot)> = None;
    for generation in shadow.list_generations()? {
        for entry in shadow.list_snapshots(&generation)? {
            let snapshot = match ShadowLog::load_snapshot(&entry.path) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(
                        "restore: skipping snapshot {}: {}",
                        entry.path.display(),
                        err
                    );
                    continue;
                }
            };
            let newer = match &best {
                None => true,
                Some((_, held, _)) => (entry.created_at, entry.tx_id) > (held.created_at, held.tx_id),
            };
            if newer {
                best = Some((generation.clone(), entry, snapshot));
            }
        }
    }

    let (generation, _, snapshot) = match best {
        Some(found) => found,
        None => return Ok(None),
    };

    let mut segments = Vec::new();
    for entry in shadow.list_segments(&generation, snapshot.header.tx_id)? {
        match ShadowLog::load_segment(&entry.path) {
            Ok(segment) => segments.push(segment),
            Err(err) => warn!(
                "restore: skipping segment {}: {}",
                entry.path.display(),
                err
            ),
        }
    }
    Ok(Some(RestoreSource { snapshot, segments }))
}

/// Walks the replicas in configured order and fetches the first populated
/// head. Fetch failures propagate: a replica that advertises a snapshot it
/// cannot produce is an error, not a fallthrough.
fn replica_source(
    cancel: &Cancel,
    replicas: &[Arc<dyn Replica>],
) -> Result<Option<RestoreSource>, StreamError> {
    for replica in replicas {
        let state = match replica.latest_state(cancel) {
            Ok(state) => state,
            Err(err) => {
                if err.is_cancelled() {
                    return Err(err);
                }
                warn!("restore: reading state of {} failed: {}", replica.name(), err);
                continue;
            }
        };
        let desc = match &state.snapshot {
            Some(desc) => desc,
            None => continue,
        };

        let snapshot = replica
            .fetch_snapshot(cancel, &state.generation, desc)
            .map_err(|err| StreamError::Replica {
                name: replica.name().to_string(),
                msg: format!("fetch snapshot: {err}"),
            })?;
        let mut segments = Vec::with_capacity(state.segments.len());
        for seg_desc in &state.segments {
            let segment = replica
                .fetch_segment(cancel, &state.generation, seg_desc)
                .map_err(|err| StreamError::Replica {
                    name: replica.name().to_string(),
                    msg: format!("fetch segment {}: {err}", seg_desc.name),
                })?;
            segments.push(segment);
        }
        return Ok(Some(RestoreSource { snapshot, segments }));
    }
    Ok(None)
}

/// Writes the decompressed snapshot into a temp file, applies the segment
/// tail by page offset, and atomically renames onto the target.
fn materialize(
    source: &RestoreSource,
    target: &Path,
    temp_dir: Option<&Path>,
) -> Result<(), StreamError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging_dir = temp_dir.unwrap_or(parent);
    fs::create_dir_all(staging_dir)?;

    let page_size = source.snapshot.header.page_size;
    if page_size == 0 {
        return Err(StreamError::InvalidSnapshot {
            msg: "snapshot header has page size zero".to_string(),
        });
    }
    let image = codec::decompress_snapshot(&source.snapshot)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".btstream-restore-")
        .suffix(".db")
        .tempfile_in(staging_dir)?;
    staged.write_all(&image)?;
    staged.as_file().sync_all()?;

    let mut ordered: Vec<&Segment> = source
        .segments
        .iter()
        .filter(|s| s.header.tx_id > source.snapshot.header.tx_id)
        .collect();
    ordered.sort_by_key(|s| s.header.tx_id);

    for segment in ordered {
        for frame in &segment.frames {
            let offset = frame.id * page_size as u64;
            staged.as_file().write_at(&frame.data, offset)?;
        }
    }
    staged.as_file().sync_all()?;

    fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o600))?;
    staged
        .persist(target)
        .map_err(|err| StreamError::Io(err.error))?;
    File::open(parent)?.sync_all()?;
    Ok(())
}
