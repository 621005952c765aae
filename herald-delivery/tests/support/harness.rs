//! In-memory delivery pipeline for tests
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! # Example
//!
//! ```rust,no_run
//! use support::{Pipeline, MockTransport};
//!
//! # async fn example() {
//! let pipeline = Pipeline::builder()
//!     .transport(MockTransport::accepting())
//!     .build();
//!
//! pipeline.add_campaign("c1", &["a@example.com", "b@example.com"]);
//! pipeline.publish("c1").await;
//! pipeline.drain().await;
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use herald_common::Signal;
use herald_delivery::{
    Audience, Campaign, CampaignStatus, CampaignStore, DeliveryConfig, DeliveryError,
    DeliveryProcessor, JobOutcome, MemoryCampaignStore, Producer, PublishRequest, StatsAggregator,
    Subscriber, SubscriberStatus,
};
use herald_queue::{Job, JobFilter, JobStore, MemoryJobStore, RetryPolicy, WorkerId};
use tokio::{sync::broadcast, task::JoinHandle};

use super::{mock_transport::MockTransport, slow_store::SlowJobStore};

/// Safety net against a drain that never settles
const MAX_DRAIN_STEPS: usize = 10_000;

pub struct PipelineBuilder {
    config: DeliveryConfig,
    transport: Option<Arc<MockTransport>>,
    enqueue_latency: Option<Duration>,
}

impl PipelineBuilder {
    fn new() -> Self {
        let config = DeliveryConfig {
            workers: 4,
            poll_interval_ms: 5,
            transport_timeout_secs: 5,
            breaker_defer_secs: 60,
            backpressure_defer_secs: 0,
            pause_defer_secs: 0,
            retry: RetryPolicy {
                max_attempts: 5,
                base_retry_delay_secs: 0,
                max_retry_delay_secs: 0,
                retry_jitter_factor: 0.0,
            },
            ..DeliveryConfig::default()
        };

        Self {
            config,
            transport: None,
            enqueue_latency: None,
        }
    }

    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(&mut DeliveryConfig)) -> Self {
        f(&mut self.config);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<MockTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Make every enqueue the processor performs take this long
    #[must_use]
    pub const fn enqueue_latency(mut self, latency: Duration) -> Self {
        self.enqueue_latency = Some(latency);
        self
    }

    pub fn build(self) -> Pipeline {
        let jobs = Arc::new(MemoryJobStore::new(self.config.retry.clone()));
        let campaigns = Arc::new(MemoryCampaignStore::new());
        let transport = self.transport.unwrap_or_else(MockTransport::accepting);

        let slow_jobs = self
            .enqueue_latency
            .map(|latency| SlowJobStore::new(jobs.clone(), latency));
        let queue: Arc<dyn JobStore> = match &slow_jobs {
            Some(slow) => slow.clone(),
            None => jobs.clone(),
        };

        let processor = Arc::new(DeliveryProcessor::new(
            self.config,
            queue,
            campaigns.clone(),
            transport.clone(),
        ));

        let stats = StatsAggregator::new(
            jobs.clone(),
            campaigns.clone(),
            processor.breaker(),
            processor.backpressure(),
        );

        Pipeline {
            jobs,
            slow_jobs,
            campaigns,
            transport,
            processor,
            stats,
        }
    }
}

pub struct Pipeline {
    pub jobs: Arc<MemoryJobStore>,
    /// Set when built with [`PipelineBuilder::enqueue_latency`]
    pub slow_jobs: Option<Arc<SlowJobStore>>,
    pub campaigns: Arc<MemoryCampaignStore>,
    pub transport: Arc<MockTransport>,
    pub processor: Arc<DeliveryProcessor>,
    pub stats: StatsAggregator,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn producer(&self) -> &Producer {
        self.processor.producer()
    }

    /// Insert a draft campaign plus one verified subscriber per address
    ///
    /// Subscriber ids are `s0`, `s1`, ... in address order.
    pub fn add_campaign(&self, id: &str, emails: &[&str]) {
        self.campaigns
            .insert_campaign(Campaign::draft(id, "Weekly digest", "Hello reader", Audience::All));

        for (i, email) in emails.iter().enumerate() {
            self.campaigns.insert_subscriber(Subscriber::new(
                format!("s{i}"),
                *email,
                SubscriberStatus::Verified,
            ));
        }
    }

    /// Queue a publish job for the campaign
    pub async fn publish(&self, campaign_id: &str) {
        self.producer()
            .enqueue_publish(PublishRequest {
                campaign_id: campaign_id.to_string(),
                operator_id: "operator".to_string(),
            })
            .await
            .expect("publish should be accepted");
    }

    /// Process jobs on one worker until nothing is eligible
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let worker = WorkerId::new("test-worker");
        let mut outcomes = Vec::new();

        for _ in 0..MAX_DRAIN_STEPS {
            match self
                .processor
                .process_next(&worker)
                .await
                .expect("queue should not fail")
            {
                Some(outcome) => outcomes.push(outcome),
                None => return outcomes,
            }
        }

        panic!("queue did not drain after {MAX_DRAIN_STEPS} steps");
    }

    /// Process a single job
    pub async fn step(&self) -> Option<JobOutcome> {
        self.processor
            .process_next(&WorkerId::new("test-worker"))
            .await
            .expect("queue should not fail")
    }

    /// The recipient job for a subscriber
    pub async fn job_for(&self, campaign_id: &str, subscriber_id: &str) -> Job {
        self.jobs
            .list(&JobFilter::campaign(campaign_id))
            .await
            .expect("list jobs")
            .into_iter()
            .find(|job| job.payload.subscriber_id() == Some(subscriber_id))
            .expect("job for subscriber")
    }

    pub async fn campaign_status(&self, campaign_id: &str) -> CampaignStatus {
        self.campaigns
            .get_campaign(campaign_id)
            .await
            .expect("campaign exists")
            .status
    }

    /// Run the worker pool in the background
    pub fn serve(&self) -> (broadcast::Sender<Signal>, JoinHandle<Result<(), DeliveryError>>) {
        let (tx, rx) = broadcast::channel(4);
        let processor = Arc::clone(&self.processor);
        let handle = tokio::spawn(async move { processor.serve(rx).await });
        (tx, handle)
    }

    /// Poll until the campaign reaches `status`
    pub async fn wait_for_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        while tokio::time::Instant::now() < deadline {
            if self.campaign_status(campaign_id).await == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        false
    }
}
