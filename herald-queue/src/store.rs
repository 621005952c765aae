use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ClaimedJob, DlqCounts, DlqEntry, DlqFilter, Enqueued, EnqueueOptions, FailOutcome, Job,
    JobCounts, JobFilter, JobId, JobPayload, Result, WorkerId,
};

/// Storage for jobs and the dead letter ledger
///
/// Implementations must guarantee single-owner execution: a job is
/// `in_progress` for at most one worker, and only the holder of a
/// [`ClaimedJob`] can complete, fail, or release it.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Add a job to the queue
    ///
    /// Idempotent on `options.dedupe_key`: a second enqueue with the same key
    /// returns the existing job with `created = false`.
    ///
    /// # Errors
    /// Returns [`QueueError::Storage`](crate::QueueError::Storage) if the job
    /// could not be stored.
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<Enqueued>;

    /// Claim the oldest eligible job for `worker`, if any
    ///
    /// Eligible jobs are `pending` or `failed` with `next_retry_at` in the past.
    /// Never blocks waiting for work.
    async fn dequeue(&self, worker: &WorkerId) -> Result<Option<ClaimedJob>>;

    /// Mark a claimed job as sent
    async fn ack(&self, claim: &ClaimedJob) -> Result<()>;

    /// Record a failed attempt
    ///
    /// Schedules a retry with exponential backoff, or moves the job to the
    /// dead letter queue once its attempts are exhausted.
    async fn fail(&self, claim: &ClaimedJob, error: &str) -> Result<FailOutcome>;

    /// Hand a claimed job back without consuming an attempt
    async fn release(&self, claim: &ClaimedJob, delay: Duration) -> Result<()>;

    /// Move a claimed job straight to the dead letter queue
    async fn dead_letter(&self, claim: &ClaimedJob, error: &str) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Job>;

    /// Jobs matching `filter`, oldest first
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn counts(&self, filter: &JobFilter) -> Result<JobCounts>;

    /// Dead letter entries matching `filter`, newest first
    async fn list_dlq(&self, filter: &DlqFilter, limit: usize) -> Result<Vec<DlqEntry>>;

    async fn dlq_counts(&self) -> Result<DlqCounts>;

    /// Put a dead job back into circulation with a fresh attempt budget
    ///
    /// The ledger entry is kept and marked as requeued.
    ///
    /// # Errors
    /// Returns [`QueueError::Conflict`](crate::QueueError::Conflict) if the job
    /// is not dead.
    async fn requeue_from_dlq(&self, id: &JobId) -> Result<()>;
}
