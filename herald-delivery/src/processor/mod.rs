//! Worker pool orchestration

mod process;

use std::{sync::Arc, time::Duration};

use herald_common::{Signal, internal, worker};
use herald_queue::{JobStore, RetryPolicy, WorkerId};
pub use process::{DeferCause, JobOutcome};
use serde::Deserialize;
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    task::JoinSet,
};

use crate::{
    backpressure::{BackpressureConfig, BackpressureManager},
    campaign::CampaignStore,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    error::{DeliveryError, SystemError},
    handlers::{DraftGenerator, FeedbackSink, LoggingDraftGenerator, LoggingFeedbackSink},
    producer::Producer,
    transport::MailTransport,
};

mod defaults {
    pub fn workers() -> usize {
        num_cpus::get()
    }

    pub const fn poll_interval_ms() -> u64 {
        250
    }

    pub const fn transport_timeout_secs() -> u64 {
        30
    }

    pub const fn breaker_defer_secs() -> u64 {
        5
    }

    pub const fn backpressure_defer_secs() -> u64 {
        1
    }

    pub const fn pause_defer_secs() -> u64 {
        30
    }

    pub const fn finalize_sweep_secs() -> u64 {
        30
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of worker tasks
    ///
    /// Default: number of CPUs
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// How long an idle worker waits before polling again (in milliseconds)
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single transport call; exceeding it is a transient
    /// failure
    #[serde(default = "defaults::transport_timeout_secs")]
    pub transport_timeout_secs: u64,

    /// Delay before a job rejected by the open circuit is claimable again
    #[serde(default = "defaults::breaker_defer_secs")]
    pub breaker_defer_secs: u64,

    /// Delay before a job rejected for lack of capacity is claimable again
    #[serde(default = "defaults::backpressure_defer_secs")]
    pub backpressure_defer_secs: u64,

    /// Delay before a publish job for a paused campaign is retried
    #[serde(default = "defaults::pause_defer_secs")]
    pub pause_defer_secs: u64,

    /// How often sending campaigns are checked for completion, in case
    /// finalizing one after its last job failed
    #[serde(default = "defaults::finalize_sweep_secs")]
    pub finalize_sweep_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            poll_interval_ms: defaults::poll_interval_ms(),
            transport_timeout_secs: defaults::transport_timeout_secs(),
            breaker_defer_secs: defaults::breaker_defer_secs(),
            backpressure_defer_secs: defaults::backpressure_defer_secs(),
            pause_defer_secs: defaults::pause_defer_secs(),
            finalize_sweep_secs: defaults::finalize_sweep_secs(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// Pulls jobs off the queue and drives them to an outcome
///
/// The breaker and backpressure manager are constructed here from the config
/// and shared with whoever needs to observe or reset them.
#[derive(Debug)]
pub struct DeliveryProcessor {
    config: DeliveryConfig,
    queue: Arc<dyn JobStore>,
    campaigns: Arc<dyn CampaignStore>,
    transport: Arc<dyn MailTransport>,
    breaker: Arc<CircuitBreaker>,
    backpressure: Arc<BackpressureManager>,
    producer: Producer,
    drafts: Arc<dyn DraftGenerator>,
    feedback: Arc<dyn FeedbackSink>,
}

impl DeliveryProcessor {
    pub fn new(
        config: DeliveryConfig,
        queue: Arc<dyn JobStore>,
        campaigns: Arc<dyn CampaignStore>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let backpressure = Arc::new(BackpressureManager::new(&config.backpressure));
        let producer = Producer::new(Arc::clone(&queue), Arc::clone(&campaigns));

        Self {
            config,
            queue,
            campaigns,
            transport,
            breaker,
            backpressure,
            producer,
            drafts: Arc::new(LoggingDraftGenerator),
            feedback: Arc::new(LoggingFeedbackSink),
        }
    }

    /// Share a producer (and its paused campaigns) with the enqueue API
    #[must_use]
    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producer = producer;
        self
    }

    #[must_use]
    pub fn with_draft_generator(mut self, drafts: Arc<dyn DraftGenerator>) -> Self {
        self.drafts = drafts;
        self
    }

    #[must_use]
    pub fn with_feedback_sink(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = feedback;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.queue)
    }

    #[must_use]
    pub fn campaigns(&self) -> Arc<dyn CampaignStore> {
        Arc::clone(&self.campaigns)
    }

    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    #[must_use]
    pub fn backpressure(&self) -> Arc<BackpressureManager> {
        Arc::clone(&self.backpressure)
    }

    #[must_use]
    pub const fn producer(&self) -> &Producer {
        &self.producer
    }

    const fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.config.transport_timeout_secs)
    }

    /// Run the worker pool until shutdown
    ///
    /// Spawns `workers` tasks that each claim and process one job at a time,
    /// plus one task sweeping for finished campaigns. On [`Signal::Shutdown`]
    /// every worker finishes the job it holds and exits; nothing is abandoned
    /// mid-attempt.
    ///
    /// # Errors
    ///
    /// Returns the first fatal queue error. The remaining workers are stopped.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn serve(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let count = self.config.workers.max(1);
        internal!(level = INFO, "Delivery processor starting {} workers", count);

        let mut workers = JoinSet::new();
        for index in 0..count {
            let processor = Arc::clone(&self);
            let shutdown = shutdown.resubscribe();
            let id = WorkerId::new(format!("worker-{index}"));

            workers.spawn(async move { processor.run_worker(id, shutdown).await });
        }

        let sweeper = Arc::clone(&self);
        let sweeper_shutdown = shutdown.resubscribe();
        workers.spawn(async move { sweeper.run_sweeper(sweeper_shutdown).await });

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Worker stopped on a fatal error, stopping pool");
                    workers.abort_all();
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::error!(error = %e, "Worker task panicked");
                    if result.is_ok() {
                        result = Err(SystemError::Internal(format!("worker panicked: {e}")).into());
                    }
                }
            }
        }

        internal!(level = INFO, "Delivery processor shutdown complete");
        result
    }

    async fn run_worker(
        &self,
        id: WorkerId,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        worker!("{} started", id);

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(_) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => break,
            }

            match self.process_next(&id).await {
                // Keep draining while there is work that was actually attempted
                Ok(Some(outcome)) if !outcome.is_deferred() => continue,
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(worker = %id, error = %e, "Queue storage failed");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(worker = %id, error = %e, "Job processing failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(idle) => {}
                _ = shutdown.recv() => break,
            }
        }

        worker!("{} stopped", id);
        Ok(())
    }

    async fn run_sweeper(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.finalize_sweep_secs.max(1)));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.finalize_stalled_campaigns().await {
                    Ok(0) => {}
                    Ok(finalized) => internal!(level = INFO, "Finalized {} stalled campaigns", finalized),
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "Queue storage failed during campaign sweep");
                        return Err(e.into());
                    }
                    Err(e) => tracing::warn!(error = %e, "Campaign sweep failed"),
                },
                _ = shutdown.recv() => break,
            }
        }

        Ok(())
    }
}
