//! # Error Taxonomy
//!
//! Every failure the forwarder can observe falls in one of two classes:
//! **transient** (retry locally with backoff, only ever logged) or
//! **permanent** (needs an operator). Invariant violations are a third,
//! programming-error class and are always fatal.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a historian read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// Timeouts, 5xx, connection resets, expired sessions. Retryable.
    #[error("transient historian error: {0}")]
    Transient(String),
    /// Dataset not found, credentials rejected. Not retryable.
    #[error("permanent historian error: {0}")]
    Permanent(String),
}

impl ReadError {
    /// `true` for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadError::Transient(_))
    }
}

/// Failure of a broker publish.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Connection lost, ack timed out. Retryable.
    #[error("transient publish error: {0}")]
    Transient(String),
    /// The message itself can never be delivered (malformed, oversized).
    #[error("permanent publish error: {0}")]
    Permanent(String),
}

impl PublishError {
    /// `true` for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Outcome of a single publish: `Ok` only once the broker acknowledged it.
pub type PublishResult = Result<(), PublishError>;

/// Failure of the durable watermark backing.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watermark store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watermark store is corrupt: {0}")]
    Corrupt(String),
}

/// Failure of a watermark operation.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// A caller tried to move the watermark backwards or sideways.
    #[error("watermark invariant violated: attempted advance from {current} to {attempted}")]
    InvariantViolation {
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    /// The new value could not be made durable; the watermark did not move.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal outcomes of the forward loop. Anything returned here stops the
/// process with a non-zero exit code.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// The historian rejected the dataset or the credentials.
    #[error("dataset cannot be read: {0}")]
    PermanentRead(ReadError),
    /// Watermark sequencing bug.
    #[error(transparent)]
    Invariant(WatermarkError),
    /// The watermark store could not be loaded at startup.
    #[error("cannot load watermark: {0}")]
    Startup(#[from] StoreError),
}
