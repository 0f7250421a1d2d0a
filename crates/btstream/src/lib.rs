#![warn(missing_docs)]

//! Page-level continuous replication for embedded B+tree key/value
//! databases.
//!
//! The controller observes the host database's commit path, captures each
//! committed transaction as a compact segment of changed page frames,
//! stages artifacts durably in a local shadow log, and fans them out to
//! replica backends alongside periodic full snapshots. Crash recovery
//! composes the freshest snapshot with its segment tail back into a
//! database file.
//!
//! Replication is asynchronous and best-effort: a replica failure is
//! reported to the commit path, never hidden, and the worst-case
//! data-loss window is queryable at any time.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod host;
pub mod replica;
pub mod replica_file;
pub mod replica_memory;
pub mod restore;
pub mod retention;
pub mod segment;
pub mod shadow;

pub use cancel::Cancel;
pub use config::{
    Config, CompressionConfig, FileReplicaConfig, MemoryReplicaConfig, ReplicaConfig,
    RestoreConfig, RetentionConfig,
};
pub use controller::Controller;
pub use error::StreamError;
pub use host::{HostDatabase, PageFlushInfo, PageFlushObserver, SnapshotSource};
pub use replica::{Replica, RestoreState};
pub use replica_file::FileReplica;
pub use replica_memory::MemoryReplica;
pub use restore::restore_standalone;
pub use segment::{
    CompressionKind, PageFrame, Segment, SegmentDescriptor, SegmentHeader, Snapshot,
    SnapshotDescriptor, SnapshotHeader,
};
pub use shadow::ShadowLog;
