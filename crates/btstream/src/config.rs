//! Controller configuration: staging, snapshot cadence, retention,
//! compression, replica destinations, and restore behavior.
//!
//! Parsing a configuration file is the host's concern; this module defines
//! the recognized options and their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::CompressionSettings;
use crate::segment::CompressionKind;

/// Default interval between full snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default minimum age before a snapshot becomes prunable.
pub const DEFAULT_SNAPSHOT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cadence of the background retention loop.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Top-level stream configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Local staging directory. Defaults to `<db dir>/stream`.
    pub shadow_dir: Option<PathBuf>,

    /// How frequently full snapshots are taken. Zero selects the default.
    pub snapshot_interval: Duration,

    /// Pruning rules for old artifacts.
    pub retention: RetentionConfig,

    /// Codec and tuning for artifact payloads.
    pub compression: CompressionConfig,

    /// Zero or more replica destinations.
    pub replicas: Vec<ReplicaConfig>,

    /// Automatic restore behavior at startup.
    pub restore: RestoreConfig,

    /// Replication lag above which a warning is emitted. Zero disables.
    pub data_loss_window_threshold: Duration,
}

impl Config {
    /// Replaces zero-valued intervals with their documented defaults.
    pub fn apply_defaults(&mut self) {
        if self.snapshot_interval.is_zero() {
            self.snapshot_interval = DEFAULT_SNAPSHOT_INTERVAL;
        }
        if self.retention.snapshot_retention.is_zero() {
            self.retention.snapshot_retention = DEFAULT_SNAPSHOT_RETENTION;
        }
        if self.retention.check_interval.is_zero() {
            self.retention.check_interval = DEFAULT_CHECK_INTERVAL;
        }
    }
}

/// The shadow directory used when none is configured.
pub fn default_shadow_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("stream")
}

/// Snapshot and segment pruning rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    /// Minimum duration to keep snapshots. Zero selects the default.
    pub snapshot_retention: Duration,

    /// How often the pruning loop runs. Zero selects the default.
    pub check_interval: Duration,
}

/// Automatic restore behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreConfig {
    /// Toggles restore before the database is opened for writes.
    pub enabled: bool,

    /// Overrides the restore destination. Defaults to the database path.
    pub target_path: Option<PathBuf>,

    /// Where intermediate restore files live. Defaults to the target's
    /// parent directory.
    pub temp_dir: Option<PathBuf>,
}

/// Codec selection and tuning for artifact payloads.
///
/// Accepted in configuration either as a bare codec string (`"zstd"`) or as
/// a full object (`{"codec": "zstd", "level": 3}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    /// The codec. Unset selects zstd.
    pub codec: Option<CompressionKind>,
    /// User-facing quality level 1..=11; 0 or unset selects the default.
    pub level: i32,
    /// Codec-specific window parameter.
    pub window: u32,
}

impl CompressionConfig {
    /// Resolves the configuration into normalized codec-native settings.
    pub fn normalized(&self) -> CompressionSettings {
        CompressionSettings {
            codec: self.codec.unwrap_or_default(),
            level: self.level,
            window: self.window,
        }
        .normalized()
    }
}

impl<'de> Deserialize<'de> for CompressionConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // The compression block is either a bare codec name or a full
        // object; discriminate on the parsed node shape.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Codec(CompressionKind),
            Full {
                #[serde(default)]
                codec: Option<CompressionKind>,
                #[serde(default)]
                level: i32,
                #[serde(default)]
                window: u32,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Codec(codec) => CompressionConfig {
                codec: Some(codec),
                level: 0,
                window: 0,
            },
            Repr::Full {
                codec,
                level,
                window,
            } => CompressionConfig {
                codec,
                level,
                window,
            },
        })
    }
}

/// A replica destination, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplicaConfig {
    /// Local filesystem directory tree.
    File(FileReplicaConfig),
    /// In-process object store with object-storage semantics.
    Memory(MemoryReplicaConfig),
}

/// Configuration for the filesystem replica backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReplicaConfig {
    /// Display name for logs and lag accounting. Defaults to the path.
    #[serde(default)]
    pub name: Option<String>,
    /// Root directory holding this replica's objects.
    pub path: PathBuf,
}

/// Configuration for the in-memory replica backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReplicaConfig {
    /// Display name for logs and lag accounting.
    #[serde(default)]
    pub name: Option<String>,
}
