use std::{
    path::Path,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

use crate::{
    ClaimedJob, DlqCounts, DlqEntry, DlqFilter, Enqueued, EnqueueOptions, FailOutcome, Job,
    JobCounts, JobFilter, JobId, JobPayload, JobStatus, JobStore, QueueError, Result,
    RetryPolicy, SnapshotError, WorkerId,
};

/// In-memory job store
///
/// Jobs live in a `DashMap`; a claim takes the entry's shard lock and
/// re-checks eligibility before flipping the job to `in_progress`, so two
/// workers can never hold the same job. The dead letter ledger is an
/// append-only `Vec` behind an `RwLock`.
///
/// Lock order is always jobs before ledger.
///
/// # Persistence
/// [`MemoryJobStore::save`] and [`MemoryJobStore::load`] write and read a
/// bincode snapshot so queued work survives a restart.
#[derive(Debug, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<DashMap<JobId, Job>>,
    dedupe: Arc<DashMap<String, JobId>>,
    dlq: Arc<RwLock<Vec<DlqEntry>>>,
    policy: RetryPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    jobs: Vec<Job>,
    dlq: Vec<DlqEntry>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            dedupe: Arc::new(DashMap::new()),
            dlq: Arc::new(RwLock::new(Vec::new())),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Serialise every job and the dead letter ledger
    ///
    /// # Errors
    /// Returns an error if the ledger lock is poisoned or encoding fails.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|job| job.value().clone()).collect();
        jobs.sort_by_key(|job| job.id);

        let snapshot = Snapshot {
            jobs,
            dlq: self.dlq.read()?.clone(),
        };

        bincode::serde::encode_to_vec(&snapshot, bincode::config::legacy())
            .map_err(|e| SnapshotError::from(e).into())
    }

    /// Rebuild a store from [`MemoryJobStore::snapshot`] output
    ///
    /// Jobs that were `in_progress` lost their worker with the process and go
    /// back to `pending`.
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn restore(bytes: &[u8], policy: RetryPolicy) -> Result<Self> {
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
                .map_err(SnapshotError::from)?;

        let store = Self::new(policy);
        let mut recovered = 0usize;

        for mut job in snapshot.jobs {
            if job.status == JobStatus::InProgress {
                job.status = JobStatus::Pending;
                job.claimed_by = None;
                recovered += 1;
            }

            if let Some(key) = &job.dedupe_key {
                store.dedupe.insert(key.clone(), job.id);
            }
            store.jobs.insert(job.id, job);
        }

        *store.dlq.write()? = snapshot.dlq;

        tracing::info!(
            jobs = store.jobs.len(),
            recovered,
            "Restored job queue from snapshot"
        );

        Ok(store)
    }

    /// Write a snapshot to `path`, replacing it atomically
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be encoded or written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.snapshot()?;
        let tmp = path.with_extension("tmp");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(SnapshotError::from)?;
        }

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(SnapshotError::from)?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(SnapshotError::from)?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Saved job queue snapshot");
        Ok(())
    }

    /// Load a store from a snapshot file, or start empty if there is none
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub async fn load(path: &Path, policy: RetryPolicy) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::restore(&bytes, policy),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(policy)),
            Err(e) => Err(SnapshotError::from(e).into()),
        }
    }

    fn check_claim(job: &Job, claim: &ClaimedJob) -> Result<()> {
        if job.status != JobStatus::InProgress || job.claimed_by.as_ref() != Some(&claim.worker) {
            return Err(QueueError::conflict(
                claim.id,
                format!("job is {} and not held by {}", job.status, claim.worker),
            ));
        }

        Ok(())
    }

    fn move_to_dlq(&self, job: &mut Job, final_error: &str) -> Result<()> {
        let now = SystemTime::now();
        let mut dlq = self.dlq.write()?;

        job.status = JobStatus::Dead;
        job.claimed_by = None;
        job.next_retry_at = None;
        job.last_error = Some(final_error.to_string());
        job.updated_at = now;

        dlq.push(DlqEntry {
            job_id: job.id,
            job_type: job.job_type(),
            campaign_id: job.payload.campaign_id().map(ToString::to_string),
            subscriber_id: job.payload.subscriber_id().map(ToString::to_string),
            error: final_error.to_string(),
            attempts: job.attempts,
            dead_at: now,
            requeued_at: None,
        });

        tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type(),
            attempts = job.attempts,
            error = %final_error,
            "Job moved to dead letter queue"
        );

        Ok(())
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<Enqueued> {
        let job = Job::new(payload, options);
        let job_id = job.id;

        match job.dedupe_key.clone() {
            Some(key) => match self.dedupe.entry(key) {
                Entry::Occupied(existing) => {
                    return Ok(Enqueued {
                        job_id: *existing.get(),
                        created: false,
                    });
                }
                Entry::Vacant(slot) => {
                    self.jobs.insert(job_id, job);
                    slot.insert(job_id);
                }
            },
            None => {
                self.jobs.insert(job_id, job);
            }
        }

        Ok(Enqueued {
            job_id,
            created: true,
        })
    }

    async fn dequeue(&self, worker: &WorkerId) -> Result<Option<ClaimedJob>> {
        let now = SystemTime::now();

        let mut candidates: Vec<(SystemTime, JobId)> = self
            .jobs
            .iter()
            .filter(|job| job.is_eligible(now))
            .map(|job| (job.created_at, job.id))
            .collect();
        candidates.sort_unstable();

        for (_, id) in candidates {
            // Another worker may have claimed it since the scan
            if let Some(mut job) = self.jobs.get_mut(&id)
                && job.is_eligible(now)
            {
                job.status = JobStatus::InProgress;
                job.claimed_by = Some(worker.clone());
                job.updated_at = now;

                return Ok(Some(ClaimedJob {
                    id,
                    payload: job.payload.clone(),
                    attempts: job.attempts,
                    worker: worker.clone(),
                }));
            }
        }

        Ok(None)
    }

    async fn ack(&self, claim: &ClaimedJob) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&claim.id)
            .ok_or(QueueError::NotFound(claim.id))?;
        Self::check_claim(&job, claim)?;

        job.attempts += 1;
        job.status = JobStatus::Sent;
        job.claimed_by = None;
        job.next_retry_at = None;
        job.updated_at = SystemTime::now();

        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, error: &str) -> Result<FailOutcome> {
        let mut job = self
            .jobs
            .get_mut(&claim.id)
            .ok_or(QueueError::NotFound(claim.id))?;
        Self::check_claim(&job, claim)?;

        job.attempts += 1;

        if self.policy.is_exhausted(job.attempts) {
            self.move_to_dlq(&mut job, error)?;
            return Ok(FailOutcome::DeadLettered {
                attempts: job.attempts,
            });
        }

        let next_retry_at = SystemTime::now() + self.policy.backoff(job.attempts);
        job.status = JobStatus::Failed;
        job.claimed_by = None;
        job.last_error = Some(error.to_string());
        job.next_retry_at = Some(next_retry_at);
        job.updated_at = SystemTime::now();

        Ok(FailOutcome::Retry {
            next_retry_at,
            attempts: job.attempts,
        })
    }

    async fn release(&self, claim: &ClaimedJob, delay: Duration) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&claim.id)
            .ok_or(QueueError::NotFound(claim.id))?;
        Self::check_claim(&job, claim)?;

        let now = SystemTime::now();
        // A retry-pending job keeps its status so stats still show the failure
        job.status = if job.attempts == 0 {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        job.claimed_by = None;
        job.next_retry_at = Some(now + delay);
        job.updated_at = now;

        Ok(())
    }

    async fn dead_letter(&self, claim: &ClaimedJob, error: &str) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&claim.id)
            .ok_or(QueueError::NotFound(claim.id))?;
        Self::check_claim(&job, claim)?;

        job.attempts += 1;
        self.move_to_dlq(&mut job, error)
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|job| job.value().clone())
            .ok_or(QueueError::NotFound(*id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|job| filter.matches(job))
            .map(|job| job.value().clone())
            .collect();

        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn counts(&self, filter: &JobFilter) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.jobs.iter().filter(|job| filter.matches(job)) {
            counts.add(job.status);
        }
        Ok(counts)
    }

    async fn list_dlq(&self, filter: &DlqFilter, limit: usize) -> Result<Vec<DlqEntry>> {
        Ok(self
            .dlq
            .read()?
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dlq_counts(&self) -> Result<DlqCounts> {
        let dlq = self.dlq.read()?;
        let requeued = dlq.iter().filter(|entry| entry.requeued_at.is_some()).count();

        Ok(DlqCounts {
            active: (dlq.len() - requeued) as u64,
            requeued: requeued as u64,
        })
    }

    async fn requeue_from_dlq(&self, id: &JobId) -> Result<()> {
        let mut job = self.jobs.get_mut(id).ok_or(QueueError::NotFound(*id))?;
        if job.status != JobStatus::Dead {
            return Err(QueueError::conflict(
                *id,
                format!("only dead jobs can be requeued, job is {}", job.status),
            ));
        }

        let now = SystemTime::now();
        let mut dlq = self.dlq.write()?;
        if let Some(entry) = dlq
            .iter_mut()
            .rev()
            .find(|entry| entry.job_id == *id && entry.requeued_at.is_none())
        {
            entry.requeued_at = Some(now);
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.next_retry_at = None;
        job.claimed_by = None;
        job.updated_at = now;

        tracing::info!(job_id = %id, "Job requeued from dead letter queue");
        Ok(())
    }
}
