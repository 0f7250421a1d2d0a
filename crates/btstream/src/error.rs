//! Error types for the replication stream.

use thiserror::Error;

/// Errors produced by the stream controller and its collaborators.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Configuration was malformed or missing required fields.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Description of the configuration problem.
        msg: String,
    },

    /// A page frame failed validation during segment formation.
    #[error("invalid page frame: {msg}")]
    InvalidFrame {
        /// Description of the violated frame invariant.
        msg: String,
    },

    /// A snapshot image failed validation.
    #[error("invalid snapshot: {msg}")]
    InvalidSnapshot {
        /// Description of the violated snapshot invariant.
        msg: String,
    },

    /// The artifact container did not start with the expected magic bytes.
    #[error("invalid artifact magic: {found}")]
    Magic {
        /// The bytes found where the magic was expected, lossily decoded.
        found: String,
    },

    /// The artifact container carries a version this build does not speak.
    #[error("unsupported artifact version: {version}")]
    Version {
        /// The version found in the container.
        version: u16,
    },

    /// The artifact container holds a different kind than the decoder expected.
    #[error("unexpected artifact kind: have {found}, want {expected}")]
    Kind {
        /// The kind octet the decoder required.
        expected: u8,
        /// The kind octet found in the container.
        found: u8,
    },

    /// The stored checksum did not match the compressed payload.
    #[error("artifact checksum mismatch: have {actual:#018x}, want {expected:#018x}")]
    Checksum {
        /// The checksum recorded in the header.
        expected: u64,
        /// The checksum computed over the payload.
        actual: u64,
    },

    /// Compression or decompression of an artifact payload failed.
    #[error("compression error: {msg}")]
    Compression {
        /// The underlying codec failure.
        msg: String,
    },

    /// The artifact container ended before its fixed fields.
    #[error("artifact container truncated at {len} bytes")]
    Truncated {
        /// The number of bytes available.
        len: usize,
    },

    /// An artifact's embedded header disagreed with its file name.
    #[error("artifact header mismatch: {msg}")]
    HeaderMismatch {
        /// Description of the disagreement.
        msg: String,
    },

    /// An object name did not follow the canonical artifact naming scheme.
    #[error("unrecognized artifact object name: {name}")]
    NameParse {
        /// The offending object name.
        name: String,
    },

    /// Binary serialization or deserialization failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// An I/O operation failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The replica manifest could not be encoded or decoded.
    #[error("manifest error")]
    Manifest(#[from] serde_json::Error),

    /// A replica backend reported a failure.
    #[error("replica {name}: {msg}")]
    Replica {
        /// The replica's stable name.
        name: String,
        /// Description of the failure.
        msg: String,
    },

    /// A requested object does not exist on the backend.
    #[error("object not found: {key}")]
    ObjectNotFound {
        /// The object key that was requested.
        key: String,
    },

    /// No snapshot could be located for a restore.
    #[error("no snapshots available for restore")]
    NoSnapshots,

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Several independent failures, joined with component prefixes.
    #[error("{prefix}: {message}")]
    Aggregate {
        /// The operation that fanned out.
        prefix: String,
        /// The `;`-joined individual failures.
        message: String,
    },
}

impl StreamError {
    /// Returns true if this error is a cancellation, which callers propagate
    /// without logging as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Collapses a list of failures into a single aggregate error.
///
/// Returns `None` when the list is empty. A single error is still wrapped so
/// the operation prefix is preserved.
pub fn aggregate(prefix: &str, errs: Vec<StreamError>) -> Option<StreamError> {
    if errs.is_empty() {
        return None;
    }
    let message = errs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Some(StreamError::Aggregate {
        prefix: prefix.to_string(),
        message,
    })
}
