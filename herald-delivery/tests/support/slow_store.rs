//! Job store with storage latency on enqueue
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! Wraps a [`MemoryJobStore`] so that creating a job takes as long as it would
//! against a real database, leaving room for workers to run while a campaign
//! is still being fanned out. A hook sees every delivery enqueue before it is
//! stored.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_queue::{
    ClaimedJob, DlqCounts, DlqEntry, DlqFilter, EnqueueOptions, Enqueued, FailOutcome, Job,
    JobCounts, JobFilter, JobId, JobPayload, JobStore, MemoryJobStore, Result, WorkerId,
};
use parking_lot::Mutex;

type EnqueueHook = Box<dyn Fn(usize) + Send + Sync>;

pub struct SlowJobStore {
    inner: Arc<MemoryJobStore>,
    enqueue_delay: Duration,
    deliveries: AtomicUsize,
    hook: Mutex<Option<EnqueueHook>>,
}

impl std::fmt::Debug for SlowJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowJobStore")
            .field("enqueue_delay", &self.enqueue_delay)
            .field("deliveries", &self.deliveries)
            .finish_non_exhaustive()
    }
}

impl SlowJobStore {
    pub fn new(inner: Arc<MemoryJobStore>, enqueue_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            enqueue_delay,
            deliveries: AtomicUsize::new(0),
            hook: Mutex::new(None),
        })
    }

    /// Call `hook` with the running count of delivery enqueues, before each
    /// one is stored
    pub fn on_delivery_enqueue(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Delivery enqueues seen so far, including deduplicated ones
    pub fn delivery_enqueues(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for SlowJobStore {
    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<Enqueued> {
        if matches!(payload, JobPayload::Delivery { .. }) {
            let count = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(hook) = self.hook.lock().as_ref() {
                hook(count);
            }
        }

        tokio::time::sleep(self.enqueue_delay).await;
        self.inner.enqueue(payload, options).await
    }

    async fn dequeue(&self, worker: &WorkerId) -> Result<Option<ClaimedJob>> {
        self.inner.dequeue(worker).await
    }

    async fn ack(&self, claim: &ClaimedJob) -> Result<()> {
        self.inner.ack(claim).await
    }

    async fn fail(&self, claim: &ClaimedJob, error: &str) -> Result<FailOutcome> {
        self.inner.fail(claim, error).await
    }

    async fn release(&self, claim: &ClaimedJob, delay: Duration) -> Result<()> {
        self.inner.release(claim, delay).await
    }

    async fn dead_letter(&self, claim: &ClaimedJob, error: &str) -> Result<()> {
        self.inner.dead_letter(claim, error).await
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.list(filter).await
    }

    async fn counts(&self, filter: &JobFilter) -> Result<JobCounts> {
        self.inner.counts(filter).await
    }

    async fn list_dlq(&self, filter: &DlqFilter, limit: usize) -> Result<Vec<DlqEntry>> {
        self.inner.list_dlq(filter, limit).await
    }

    async fn dlq_counts(&self) -> Result<DlqCounts> {
        self.inner.dlq_counts().await
    }

    async fn requeue_from_dlq(&self, id: &JobId) -> Result<()> {
        self.inner.requeue_from_dlq(id).await
    }
}
