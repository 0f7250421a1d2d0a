//! Artifact types: page frames, segments, snapshots, and the canonical
//! object naming they are stored under.
//!
//! A segment captures one committed transaction's dirty pages; a snapshot
//! captures the whole database file at one transaction. Both carry a fixed
//! header and an opaque compressed payload.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Magic bytes opening every artifact container.
pub const ARTIFACT_MAGIC: &[u8; 4] = b"BTLS";

/// Artifact container format version this build reads and writes.
pub const ARTIFACT_VERSION: u16 = 1;

/// File extension for segment artifacts.
pub const SEGMENT_EXT: &str = ".segment";

/// File extension for snapshot artifacts.
pub const SNAPSHOT_EXT: &str = ".snapshot";

/// Compression codec applied to artifact payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// No compression.
    None,
    /// Zstandard.
    #[default]
    Zstd,
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionKind::None => f.write_str("none"),
            CompressionKind::Zstd => f.write_str("zstd"),
        }
    }
}

/// A single page payload captured from the host's commit path.
///
/// `data` holds the page bytes plus any overflow pages concatenated, so its
/// length is always `(overflow + 1) * page_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFrame {
    /// The logical page identifier.
    pub id: u64,
    /// Number of overflow pages concatenated after the first.
    pub overflow: u32,
    /// Raw page bytes.
    pub data: Vec<u8>,
}

impl PageFrame {
    /// The byte length this frame must have for the given page size.
    pub fn expected_len(&self, page_size: u32) -> usize {
        (self.overflow as usize + 1) * page_size as usize
    }

    /// Validates the frame length invariant against the page size.
    pub fn validate(&self, page_size: u32) -> Result<(), StreamError> {
        let want = self.expected_len(page_size);
        if self.data.len() != want {
            return Err(StreamError::InvalidFrame {
                msg: format!(
                    "page {} length mismatch: have {}, want {}",
                    self.id,
                    self.data.len(),
                    want
                ),
            });
        }
        Ok(())
    }
}

/// Metadata written alongside a segment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentHeader {
    /// Artifact magic, always `"BTLS"`.
    pub magic: String,
    /// Artifact format version, always 1.
    pub version: u16,
    /// The transaction this segment captures.
    pub tx_id: u64,
    /// The transaction this segment extends.
    pub parent_tx_id: u64,
    /// Number of page frames in the payload.
    pub page_count: u32,
    /// The host database's page size in bytes.
    pub page_size: u32,
    /// CRC64 (ISO polynomial) over the compressed payload.
    pub checksum: u64,
    /// Codec applied to the payload.
    pub compression: CompressionKind,
    /// Codec-native quality level.
    pub compression_level: i32,
    /// Codec-specific window parameter; 0 unless the codec uses it.
    pub compression_window: u32,
    /// Creation wall-clock, UTC.
    pub created_at: DateTime<Utc>,
    /// Highest page number ever allocated by the host, for diagnostics.
    pub high_water_mark: u64,
    /// Optional free-form attributes.
    pub attrs: BTreeMap<String, String>,
}

/// An incremental artifact: one transaction's dirty pages.
///
/// `data` is the compressed encoding of `{header, frames}` and is what
/// backends store; `frames` is the decoded view.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Fixed metadata, including the payload checksum.
    pub header: SegmentHeader,
    /// Decoded page frames, in host emission order.
    pub frames: Vec<PageFrame>,
    /// Compressed encoded payload.
    pub data: Vec<u8>,
}

/// Metadata written alongside a snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHeader {
    /// Artifact magic, always `"BTLS"`.
    pub magic: String,
    /// Artifact format version, always 1.
    pub version: u16,
    /// The read transaction the snapshot was taken from.
    pub tx_id: u64,
    /// Total page count of the database image.
    pub page_count: u64,
    /// The host database's page size in bytes.
    pub page_size: u32,
    /// Codec applied to the payload.
    pub compression: CompressionKind,
    /// Codec-native quality level.
    pub compression_level: i32,
    /// Codec-specific window parameter; 0 unless the codec uses it.
    pub compression_window: u32,
    /// Creation wall-clock, UTC.
    pub created_at: DateTime<Utc>,
}

/// A full artifact: the complete database image at one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Fixed metadata.
    pub header: SnapshotHeader,
    /// Compressed database image.
    pub data: Vec<u8>,
}

/// A pointer to a stored snapshot object on a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    /// Backend-relative object name.
    pub name: String,
    /// Snapshot creation time.
    pub timestamp: DateTime<Utc>,
    /// Stored object size in bytes.
    pub size: u64,
}

/// A pointer to a stored segment object on a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDescriptor {
    /// Backend-relative object name.
    pub name: String,
    /// First transaction covered, `parent_tx_id + 1`.
    pub first_tx_id: u64,
    /// Last transaction covered, the segment's own `tx_id`.
    pub last_tx_id: u64,
    /// Upload or creation time.
    pub timestamp: DateTime<Utc>,
    /// Stored object size in bytes.
    pub size: u64,
}

/// Formats a timestamp the way artifact object names embed it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// File name for a segment artifact: `<txid hex16>.segment`.
pub fn segment_file_name(tx_id: u64) -> String {
    format!("{tx_id:016x}{SEGMENT_EXT}")
}

/// File name for a snapshot artifact: `<rfc3339nano>-<txid hex16>.snapshot`.
pub fn snapshot_file_name(created_at: &DateTime<Utc>, tx_id: u64) -> String {
    format!("{}-{tx_id:016x}{SNAPSHOT_EXT}", format_timestamp(created_at))
}

/// Backend-relative object name for a segment.
pub fn segment_object_name(generation: &str, tx_id: u64) -> String {
    format!("{generation}/segments/{}", segment_file_name(tx_id))
}

/// Backend-relative object name for a snapshot.
pub fn snapshot_object_name(generation: &str, created_at: &DateTime<Utc>, tx_id: u64) -> String {
    format!(
        "{generation}/snapshots/{}",
        snapshot_file_name(created_at, tx_id)
    )
}

/// Recovers the transaction id from a segment file name.
pub fn parse_segment_file_name(name: &str) -> Result<u64, StreamError> {
    let stem = name
        .strip_suffix(SEGMENT_EXT)
        .ok_or_else(|| StreamError::NameParse {
            name: name.to_string(),
        })?;
    u64::from_str_radix(stem, 16).map_err(|_| StreamError::NameParse {
        name: name.to_string(),
    })
}

/// Recovers the creation time and transaction id from a snapshot file name.
pub fn parse_snapshot_file_name(name: &str) -> Result<(DateTime<Utc>, u64), StreamError> {
    let stem = name
        .strip_suffix(SNAPSHOT_EXT)
        .ok_or_else(|| StreamError::NameParse {
            name: name.to_string(),
        })?;
    // The timestamp itself contains '-', so split on the last one.
    let (ts_part, tx_part) = stem.rsplit_once('-').ok_or_else(|| StreamError::NameParse {
        name: name.to_string(),
    })?;
    let created_at = DateTime::parse_from_rfc3339(ts_part)
        .map_err(|_| StreamError::NameParse {
            name: name.to_string(),
        })?
        .with_timezone(&Utc);
    let tx_id = u64::from_str_radix(tx_part, 16).map_err(|_| StreamError::NameParse {
        name: name.to_string(),
    })?;
    Ok((created_at, tx_id))
}
