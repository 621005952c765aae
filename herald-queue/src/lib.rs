//! Job queue and dead letter queue for herald
//!
//! Producers [`enqueue`](JobStore::enqueue) jobs; workers
//! [`dequeue`](JobStore::dequeue) them, which atomically claims the job for a
//! single worker, and then `ack`, `fail`, `release` or `dead_letter` the claim.
//! Failures are retried with exponential backoff according to a
//! [`RetryPolicy`] until the attempts run out, at which point the job lands in
//! the append-only dead letter ledger.

pub mod error;
pub mod memory;
pub mod retry;
pub mod store;
pub mod types;

pub use error::{QueueError, Result, SnapshotError};
pub use memory::MemoryJobStore;
pub use retry::RetryPolicy;
pub use store::JobStore;
pub use types::{
    ClaimedJob, DlqCounts, DlqEntry, DlqFilter, Enqueued, EnqueueOptions, FailOutcome, Job,
    JobCounts, JobFilter, JobId, JobPayload, JobStatus, JobType, WorkerId,
};
