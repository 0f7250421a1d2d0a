//! Artifact container encoding and decoding.
//!
//! Artifacts travel as a deterministic binary container: magic, version, a
//! kind octet, the bincode-encoded header, then the compressed payload. A
//! segment's payload is the encoded `{header, frames}` pair; a snapshot's
//! payload is the raw database image. The segment checksum is CRC64 (ISO
//! polynomial) over the compressed payload and is verified before any frame
//! is exposed.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::segment::{
    CompressionKind, PageFrame, Segment, SegmentHeader, Snapshot, SnapshotHeader, ARTIFACT_MAGIC,
    ARTIFACT_VERSION,
};

/// Kind octet for segment containers.
const KIND_SEGMENT: u8 = 1;
/// Kind octet for snapshot containers.
const KIND_SNAPSHOT: u8 = 2;

/// Fixed container prefix: magic (4) + version (2) + kind (1) + header len (4).
const CONTAINER_PREFIX_LEN: usize = 11;

/// Normalized compression parameters applied to artifact payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    /// The codec.
    pub codec: CompressionKind,
    /// Codec-native quality level.
    pub level: i32,
    /// Codec-specific window; 0 unless the codec uses it.
    pub window: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            codec: CompressionKind::Zstd,
            level: zstd_level_from_user(0),
            window: 0,
        }
    }
}

impl CompressionSettings {
    /// Clamps the settings into the codec's supported range.
    ///
    /// For zstd the user-facing level 1..=11 is mapped to the codec-native
    /// level; for `none` both level and window are meaningless and zeroed.
    pub fn normalized(mut self) -> Self {
        match self.codec {
            CompressionKind::Zstd => {
                self.level = zstd_level_from_user(self.level);
                self.window = 0;
            }
            CompressionKind::None => {
                self.level = 0;
                self.window = 0;
            }
        }
        self
    }
}

/// Maps a user-facing compression level (1..=11) to a zstd-native level.
///
/// Level 0 or below selects the default user level 6. Levels above 11 clamp.
fn zstd_level_from_user(level: i32) -> i32 {
    const TABLE: [i32; 12] = [0, -5, -3, -1, 0, 3, 6, 9, 12, 15, 18, 22];
    let user = if level <= 0 {
        6
    } else if level > 11 {
        11
    } else {
        level
    };
    TABLE[user as usize]
}

/// CRC64 with the ISO polynomial, reflected, as used for segment payloads.
pub fn crc64_iso(data: &[u8]) -> u64 {
    const POLY: u64 = 0xD800_0000_0000_0000;
    let mut crc: u64 = !0;
    for &byte in data {
        crc ^= byte as u64;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Compresses a payload with the given settings.
pub fn compress(settings: CompressionSettings, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
    match settings.codec {
        CompressionKind::None => Ok(payload.to_vec()),
        CompressionKind::Zstd => zstd::stream::encode_all(payload, settings.level).map_err(|e| {
            StreamError::Compression {
                msg: format!("zstd encode: {e}"),
            }
        }),
    }
}

/// Decompresses a payload produced by [`compress`] with the same codec.
pub fn decompress(codec: CompressionKind, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
    match codec {
        CompressionKind::None => Ok(payload.to_vec()),
        CompressionKind::Zstd => {
            zstd::stream::decode_all(payload).map_err(|e| StreamError::Compression {
                msg: format!("zstd decode: {e}"),
            })
        }
    }
}

#[derive(Serialize)]
struct SegmentPayloadRef<'a> {
    header: &'a SegmentHeader,
    frames: &'a [PageFrame],
}

#[derive(Deserialize)]
struct SegmentPayload {
    header: SegmentHeader,
    frames: Vec<PageFrame>,
}

/// Seals artifacts with a fixed set of compression settings.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    settings: CompressionSettings,
}

impl Codec {
    /// Creates a codec from codec-native settings.
    ///
    /// Settings coming from configuration are normalized exactly once at
    /// the config boundary ([`crate::config::CompressionConfig::normalized`]);
    /// re-normalizing would misread native levels as user levels.
    pub fn new(settings: CompressionSettings) -> Self {
        Codec { settings }
    }

    /// The normalized settings this codec stamps into headers.
    pub fn settings(&self) -> CompressionSettings {
        self.settings
    }

    /// Builds a complete segment from a header template and its frames.
    ///
    /// Validates the frames (no duplicate ids, exact lengths), encodes and
    /// compresses the payload, and stores the payload checksum in the
    /// header.
    pub fn seal_segment(
        &self,
        mut header: SegmentHeader,
        frames: Vec<PageFrame>,
    ) -> Result<Segment, StreamError> {
        let mut seen = std::collections::HashSet::with_capacity(frames.len());
        for frame in &frames {
            frame.validate(header.page_size)?;
            if !seen.insert(frame.id) {
                return Err(StreamError::InvalidFrame {
                    msg: format!("duplicate page id {} in segment", frame.id),
                });
            }
        }

        header.magic = String::from_utf8_lossy(ARTIFACT_MAGIC).into_owned();
        header.version = ARTIFACT_VERSION;
        header.page_count = frames.len() as u32;
        header.compression = self.settings.codec;
        header.compression_level = self.settings.level;
        header.compression_window = self.settings.window;

        // The checksum covers the compressed payload, so the header encoded
        // inside the payload carries a zero checksum.
        let mut inner = header.clone();
        inner.checksum = 0;
        let raw = bincode::serialize(&SegmentPayloadRef {
            header: &inner,
            frames: &frames,
        })?;
        let data = compress(self.settings, &raw)?;
        header.checksum = crc64_iso(&data);

        Ok(Segment {
            header,
            frames,
            data,
        })
    }

    /// Builds a complete snapshot from a header template and the raw
    /// database image.
    ///
    /// The image length must be an exact multiple of the page size; the
    /// header's page count is derived from it.
    pub fn seal_snapshot(
        &self,
        mut header: SnapshotHeader,
        image: &[u8],
    ) -> Result<Snapshot, StreamError> {
        if header.page_size == 0 {
            return Err(StreamError::InvalidSnapshot {
                msg: "page size is zero".to_string(),
            });
        }
        if image.len() % header.page_size as usize != 0 {
            return Err(StreamError::InvalidSnapshot {
                msg: format!(
                    "image length {} is not a multiple of page size {}",
                    image.len(),
                    header.page_size
                ),
            });
        }

        header.magic = String::from_utf8_lossy(ARTIFACT_MAGIC).into_owned();
        header.version = ARTIFACT_VERSION;
        header.page_count = image.len() as u64 / header.page_size as u64;
        header.compression = self.settings.codec;
        header.compression_level = self.settings.level;
        header.compression_window = self.settings.window;

        let data = compress(self.settings, image)?;
        Ok(Snapshot { header, data })
    }
}

fn encode_container(kind: u8, header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONTAINER_PREFIX_LEN + header.len() + payload.len());
    out.extend_from_slice(ARTIFACT_MAGIC);
    out.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(header);
    out.extend_from_slice(payload);
    out
}

fn split_container(kind: u8, buf: &[u8]) -> Result<(&[u8], &[u8]), StreamError> {
    if buf.len() < CONTAINER_PREFIX_LEN {
        return Err(StreamError::Truncated { len: buf.len() });
    }
    if &buf[..4] != ARTIFACT_MAGIC {
        return Err(StreamError::Magic {
            found: String::from_utf8_lossy(&buf[..4]).into_owned(),
        });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != ARTIFACT_VERSION {
        return Err(StreamError::Version { version });
    }
    if buf[6] != kind {
        return Err(StreamError::Kind {
            expected: kind,
            found: buf[6],
        });
    }
    let header_len = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;
    let body = &buf[CONTAINER_PREFIX_LEN..];
    if body.len() < header_len {
        return Err(StreamError::Truncated { len: buf.len() });
    }
    Ok(body.split_at(header_len))
}

fn check_header_identity(magic: &str, version: u16) -> Result<(), StreamError> {
    if magic.as_bytes() != ARTIFACT_MAGIC {
        return Err(StreamError::Magic {
            found: magic.to_string(),
        });
    }
    if version != ARTIFACT_VERSION {
        return Err(StreamError::Version { version });
    }
    Ok(())
}

/// Encodes a sealed segment into its on-disk/wire container.
pub fn encode_segment(segment: &Segment) -> Result<Vec<u8>, StreamError> {
    let header = bincode::serialize(&segment.header)?;
    Ok(encode_container(KIND_SEGMENT, &header, &segment.data))
}

/// Decodes a segment container, verifying magic, version, and checksum
/// before exposing any frame.
pub fn decode_segment(buf: &[u8]) -> Result<Segment, StreamError> {
    let (header_buf, payload) = split_container(KIND_SEGMENT, buf)?;
    let header: SegmentHeader = bincode::deserialize(header_buf)?;
    check_header_identity(&header.magic, header.version)?;

    let actual = crc64_iso(payload);
    if actual != header.checksum {
        return Err(StreamError::Checksum {
            expected: header.checksum,
            actual,
        });
    }

    let raw = decompress(header.compression, payload)?;
    let inner: SegmentPayload = bincode::deserialize(&raw)?;

    let mut expected_inner = header.clone();
    expected_inner.checksum = 0;
    if inner.header != expected_inner {
        return Err(StreamError::HeaderMismatch {
            msg: format!(
                "payload header for tx {} disagrees with container header for tx {}",
                inner.header.tx_id, header.tx_id
            ),
        });
    }

    Ok(Segment {
        header,
        frames: inner.frames,
        data: payload.to_vec(),
    })
}

/// Encodes a sealed snapshot into its on-disk/wire container.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, StreamError> {
    let header = bincode::serialize(&snapshot.header)?;
    Ok(encode_container(KIND_SNAPSHOT, &header, &snapshot.data))
}

/// Decodes a snapshot container.
///
/// The image stays compressed; use [`decompress_snapshot`] to materialize it.
pub fn decode_snapshot(buf: &[u8]) -> Result<Snapshot, StreamError> {
    let (header_buf, payload) = split_container(KIND_SNAPSHOT, buf)?;
    let header: SnapshotHeader = bincode::deserialize(header_buf)?;
    check_header_identity(&header.magic, header.version)?;
    Ok(Snapshot {
        header,
        data: payload.to_vec(),
    })
}

/// Decompresses a snapshot's database image.
pub fn decompress_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, StreamError> {
    decompress(snapshot.header.compression, &snapshot.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn segment_header(page_size: u32) -> SegmentHeader {
        SegmentHeader {
            magic: String::new(),
            version: 0,
            tx_id: 9,
            parent_tx_id: 8,
            page_count: 0,
            page_size,
            checksum: 0,
            compression: CompressionKind::None,
            compression_level: 0,
            compression_window: 0,
            created_at: Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap(),
            high_water_mark: 12,
            attrs: BTreeMap::new(),
        }
    }

    fn snapshot_header(page_size: u32) -> SnapshotHeader {
        SnapshotHeader {
            magic: String::new(),
            version: 0,
            tx_id: 4,
            page_count: 0,
            page_size,
            compression: CompressionKind::None,
            compression_level: 0,
            compression_window: 0,
            created_at: Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap(),
        }
    }

    fn frames(page_size: u32) -> Vec<PageFrame> {
        vec![
            PageFrame {
                id: 2,
                overflow: 0,
                data: vec![0xaa; page_size as usize],
            },
            PageFrame {
                id: 5,
                overflow: 1,
                data: vec![0xbb; 2 * page_size as usize],
            },
        ]
    }

    #[test]
    fn test_crc64_iso_check_vector() {
        // CRC-64/GO-ISO check value for "123456789".
        assert_eq!(crc64_iso(b"123456789"), 0xb909_56c7_75a4_1001);
    }

    #[test]
    fn test_crc64_detects_single_bit_change() {
        let a = crc64_iso(b"replication");
        let b = crc64_iso(b"replicatioo");
        assert_ne!(a, b);
    }

    #[test]
    fn test_zstd_level_table() {
        assert_eq!(zstd_level_from_user(1), -5);
        assert_eq!(zstd_level_from_user(4), 0);
        assert_eq!(zstd_level_from_user(6), 6);
        assert_eq!(zstd_level_from_user(11), 22);
    }

    #[test]
    fn test_zstd_level_defaults_and_clamps() {
        assert_eq!(zstd_level_from_user(0), 6);
        assert_eq!(zstd_level_from_user(-3), 6);
        assert_eq!(zstd_level_from_user(99), 22);
    }

    #[test]
    fn test_normalize_none_zeroes_tuning() {
        let settings = CompressionSettings {
            codec: CompressionKind::None,
            level: 5,
            window: 7,
        }
        .normalized();
        assert_eq!(settings.level, 0);
        assert_eq!(settings.window, 0);
    }

    #[test]
    fn test_segment_round_trip_uncompressed() {
        let codec = Codec::new(CompressionSettings {
            codec: CompressionKind::None,
            level: 0,
            window: 0,
        });
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        let bytes = encode_segment(&sealed).unwrap();
        let decoded = decode_segment(&bytes).unwrap();
        assert_eq!(decoded, sealed);
    }

    #[test]
    fn test_segment_round_trip_zstd() {
        let codec = Codec::new(CompressionSettings {
            codec: CompressionKind::Zstd,
            level: 3,
            window: 0,
        });
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        let bytes = encode_segment(&sealed).unwrap();
        let decoded = decode_segment(&bytes).unwrap();
        assert_eq!(decoded, sealed);
        assert_eq!(decoded.header.compression, CompressionKind::Zstd);
    }

    #[test]
    fn test_seal_fills_header_identity() {
        let codec = Codec::new(CompressionSettings::default());
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        assert_eq!(sealed.header.magic, "BTLS");
        assert_eq!(sealed.header.version, 1);
        assert_eq!(sealed.header.page_count, 2);
        assert_eq!(sealed.header.checksum, crc64_iso(&sealed.data));
    }

    #[test]
    fn test_seal_rejects_duplicate_page_ids() {
        let codec = Codec::new(CompressionSettings::default());
        let mut dup = frames(64);
        dup[1].id = dup[0].id;
        dup[1].overflow = 0;
        dup[1].data.truncate(64);
        let err = codec.seal_segment(segment_header(64), dup).unwrap_err();
        assert!(matches!(err, StreamError::InvalidFrame { .. }));
    }

    #[test]
    fn test_seal_rejects_bad_frame_length() {
        let codec = Codec::new(CompressionSettings::default());
        let mut bad = frames(64);
        bad[0].data.pop();
        let err = codec.seal_segment(segment_header(64), bad).unwrap_err();
        assert!(matches!(err, StreamError::InvalidFrame { .. }));
    }

    #[test]
    fn test_decode_rejects_payload_corruption() {
        let codec = Codec::new(CompressionSettings::default());
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        let mut bytes = encode_segment(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = decode_segment(&bytes).unwrap_err();
        assert!(matches!(err, StreamError::Checksum { .. }));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let codec = Codec::new(CompressionSettings::default());
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        let mut bytes = encode_segment(&sealed).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_segment(&bytes),
            Err(StreamError::Magic { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let codec = Codec::new(CompressionSettings::default());
        let sealed = codec.seal_segment(segment_header(64), frames(64)).unwrap();
        let mut bytes = encode_segment(&sealed).unwrap();
        bytes[4] = 9;
        assert!(matches!(
            decode_segment(&bytes),
            Err(StreamError::Version { version: 9 })
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_kind() {
        let codec = Codec::new(CompressionSettings::default());
        let sealed = codec
            .seal_snapshot(snapshot_header(64), &[0u8; 128])
            .unwrap();
        let bytes = encode_snapshot(&sealed).unwrap();
        assert!(matches!(
            decode_segment(&bytes),
            Err(StreamError::Kind { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_container() {
        assert!(matches!(
            decode_segment(b"BTL"),
            Err(StreamError::Truncated { .. })
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let codec = Codec::new(CompressionSettings {
            codec: CompressionKind::Zstd,
            level: 1,
            window: 0,
        });
        let image: Vec<u8> = (0..4 * 64).map(|i| i as u8).collect();
        let sealed = codec.seal_snapshot(snapshot_header(64), &image).unwrap();
        assert_eq!(sealed.header.page_count, 4);
        let bytes = encode_snapshot(&sealed).unwrap();
        let decoded = decode_snapshot(&bytes).unwrap();
        assert_eq!(decoded, sealed);
        assert_eq!(decompress_snapshot(&decoded).unwrap(), image);
    }

    #[test]
    fn test_seal_snapshot_rejects_misaligned_image() {
        let codec = Codec::new(CompressionSettings::default());
        let err = codec
            .seal_snapshot(snapshot_header(64), &[0u8; 100])
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidSnapshot { .. }));
    }

    #[test]
    fn test_seal_snapshot_rejects_zero_page_size() {
        let codec = Codec::new(CompressionSettings::default());
        let err = codec
            .seal_snapshot(snapshot_header(0), &[0u8; 64])
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidSnapshot { .. }));
    }
}
