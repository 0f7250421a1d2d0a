//! The contract between the stream controller and its host database.
//!
//! The host owns the B+tree engine, its commit path, and its page layout.
//! The controller only needs three things from it: the database path and
//! page size, a consistent read view it can serialize, and delivery of
//! flushed page frames after each commit.

use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::StreamError;
use crate::segment::PageFrame;

/// Metadata about one completed page flush, delivered on the host's commit
/// thread.
#[derive(Debug, Clone)]
pub struct PageFlushInfo {
    /// The committed transaction.
    pub tx_id: u64,
    /// The transaction this commit extends.
    pub parent_tx_id: u64,
    /// Path of the database file.
    pub db_path: PathBuf,
    /// The database page size in bytes.
    pub page_size: u32,
    /// Total page count of the database after this commit.
    pub page_count: u32,
    /// Highest page number ever allocated.
    pub high_water_mark: u64,
    /// Commit wall-clock, if the host records one.
    pub timestamp: Option<DateTime<Utc>>,
    /// The dirty pages of this commit, in emission order.
    pub frames: Vec<PageFrame>,
}

/// Receives page flush notifications from the host.
///
/// A returned error is surfaced by the host as a commit failure; the host
/// decides whether to crash or log.
pub trait PageFlushObserver: Send + Sync {
    /// Called after the host has durably written a transaction's pages.
    fn on_page_flush(&self, info: &PageFlushInfo) -> Result<(), StreamError>;
}

/// A consistent read transaction the controller can serialize.
pub trait SnapshotSource {
    /// The read transaction's id. Negative ids are coerced to zero by the
    /// controller.
    fn id(&self) -> i64;

    /// Serializes a byte-for-byte image of the database into `out`,
    /// returning the number of bytes written.
    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64>;
}

/// The host database surface the controller consumes.
pub trait HostDatabase: Send + Sync {
    /// Path of the database file.
    fn path(&self) -> PathBuf;

    /// The database page size in bytes.
    fn page_size(&self) -> u32;

    /// Invokes `f` with a read-only view of the database. The view holds no
    /// writer lock; concurrent commits proceed.
    fn view(
        &self,
        f: &mut dyn FnMut(&dyn SnapshotSource) -> Result<(), StreamError>,
    ) -> Result<(), StreamError>;
}
