//! Error types for the herald-queue crate.

use std::io;

use thiserror::Error;

use crate::JobId;

/// Top-level queue error type.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job with this id exists.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The job is not in a state that allows the operation, or the caller
    /// does not hold its claim.
    #[error("Conflict on job {job_id}: {reason}")]
    Conflict { job_id: JobId, reason: String },

    /// The backing storage failed. Fatal for the worker pool.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Reading or writing a queue snapshot failed.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl QueueError {
    pub(crate) fn conflict(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            job_id,
            reason: reason.into(),
        }
    }

    /// Whether the error should stop the worker pool
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Snapshot(_))
    }
}

/// Snapshot persistence errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// Convenience conversion for lock poisoning
impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Storage(format!("Lock poisoned: {e}"))
    }
}
