//! Cooperative cancellation for long-running replication operations.
//!
//! Every replica and restore operation checks the token at its I/O
//! boundaries so shutdown propagates promptly without interrupting a write
//! mid-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StreamError;

/// A shared cancellation flag.
///
/// Cloning is cheap; all clones observe the same flag. Once cancelled a
/// token never resets.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`Cancel::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(StreamError::Cancelled)` once cancellation is requested.
    ///
    /// Call this at every I/O boundary of a long-running operation.
    pub fn check(&self) -> Result<(), StreamError> {
        if self.is_cancelled() {
            Err(StreamError::Cancelled)
        } else {
            Ok(())
        }
    }
}
