//! Read-only views over the queue, DLQ and reliability guards
//!
//! Everything is computed on demand from the live state; nothing here keeps a
//! counter of its own.

use std::{sync::Arc, time::SystemTime};

use herald_common::audit::mask_email;
use herald_queue::{DlqCounts, DlqFilter, JobCounts, JobFilter, JobId, JobStore, JobType};
use serde::{Deserialize, Serialize};

use crate::{
    backpressure::{BackpressureManager, BackpressureStatus},
    campaign::{Campaign, CampaignStore},
    circuit_breaker::{CircuitBreaker, CircuitSnapshot},
    error::StatsError,
};

/// Per-campaign or global delivery totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub sent: u64,
    /// Jobs that ended in the dead letter queue
    pub failed: u64,
    /// Jobs that can still change: pending, in progress or awaiting retry
    pub pending: u64,
    pub total: u64,
    /// Sent as a percentage of the total
    pub success_rate: f64,
}

impl From<JobCounts> for DeliveryStats {
    #[allow(clippy::cast_precision_loss, reason = "Percentages do not need u64 precision")]
    fn from(counts: JobCounts) -> Self {
        let total = counts.total();
        let success_rate = if total == 0 {
            0.0
        } else {
            counts.sent as f64 / total as f64 * 100.0
        };

        Self {
            sent: counts.sent,
            failed: counts.dead,
            pending: counts.non_terminal(),
            total,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    /// Recipient job counts by status
    pub newsletter: JobCounts,
    pub dlq: DlqCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue: QueueDepths,
    pub stats: DeliveryStats,
    pub circuit: CircuitSnapshot,
    pub backpressure: BackpressureStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign: Campaign,
    pub stats: DeliveryStats,
}

/// A dead letter entry prepared for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: JobId,
    pub job_type: JobType,
    pub campaign_id: Option<String>,
    /// Masked recipient address, when the job had one
    pub recipient: Option<String>,
    pub error: String,
    pub attempts: u32,
    pub dead_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct StatsAggregator {
    queue: Arc<dyn JobStore>,
    campaigns: Arc<dyn CampaignStore>,
    breaker: Arc<CircuitBreaker>,
    backpressure: Arc<BackpressureManager>,
}

impl StatsAggregator {
    pub fn new(
        queue: Arc<dyn JobStore>,
        campaigns: Arc<dyn CampaignStore>,
        breaker: Arc<CircuitBreaker>,
        backpressure: Arc<BackpressureManager>,
    ) -> Self {
        Self {
            queue,
            campaigns,
            breaker,
            backpressure,
        }
    }

    /// Totals for one campaign, or for every recipient job
    ///
    /// # Errors
    ///
    /// [`StatsError::CampaignNotFound`] for an unknown campaign, or any error
    /// reading the queue.
    pub async fn delivery_stats(&self, campaign_id: Option<&str>) -> Result<DeliveryStats, StatsError> {
        let filter = match campaign_id {
            Some(id) => {
                self.campaigns.get_campaign(id).await?;
                JobFilter::campaign(id)
            }
            None => JobFilter {
                job_type: Some(JobType::Delivery),
                ..JobFilter::default()
            },
        };

        Ok(self.queue.counts(&filter).await?.into())
    }

    /// Exact per-status counts for any filter
    ///
    /// # Errors
    ///
    /// Any error reading the queue.
    pub async fn job_counts(&self, filter: &JobFilter) -> Result<JobCounts, StatsError> {
        Ok(self.queue.counts(filter).await?)
    }

    /// Queue depth, DLQ depth, totals, breaker and backpressure in one view
    ///
    /// # Errors
    ///
    /// Any error reading the queue.
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot, StatsError> {
        let newsletter = self
            .queue
            .counts(&JobFilter {
                job_type: Some(JobType::Delivery),
                ..JobFilter::default()
            })
            .await?;
        let dlq = self.queue.dlq_counts().await?;

        Ok(QueueSnapshot {
            queue: QueueDepths { newsletter, dlq },
            stats: newsletter.into(),
            circuit: self.breaker.snapshot(),
            backpressure: self.backpressure.status(),
        })
    }

    /// Newest campaigns with their delivery totals
    ///
    /// # Errors
    ///
    /// Any error reading the content store or the queue.
    pub async fn recent_campaigns(&self, limit: usize) -> Result<Vec<CampaignSummary>, StatsError> {
        let campaigns = self.campaigns.list_campaigns(limit).await?;

        let mut summaries = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            let counts = self.queue.counts(&JobFilter::campaign(&campaign.id)).await?;
            summaries.push(CampaignSummary {
                campaign,
                stats: counts.into(),
            });
        }

        Ok(summaries)
    }

    /// Newest active dead letter entries with recipients masked
    ///
    /// # Errors
    ///
    /// Any error reading the DLQ or the content store.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>, StatsError> {
        let entries = self.queue.list_dlq(&DlqFilter::default(), limit).await?;

        let mut failed = Vec::with_capacity(entries.len());
        for entry in entries {
            let recipient = match &entry.subscriber_id {
                Some(id) => Some(
                    self.campaigns
                        .get_subscriber(id)
                        .await?
                        .map_or_else(|| "***".to_string(), |s| mask_email(&s.email)),
                ),
                None => None,
            };

            failed.push(FailedJob {
                job_id: entry.job_id,
                job_type: entry.job_type,
                campaign_id: entry.campaign_id,
                recipient,
                error: entry.error,
                attempts: entry.attempts,
                dead_at: entry.dead_at,
            });
        }

        Ok(failed)
    }

    /// Push the current queue and guard state into the metrics gauges
    ///
    /// # Errors
    ///
    /// Any error reading the queue.
    pub async fn publish_metrics(&self) -> Result<(), StatsError> {
        let Some(metrics) = herald_metrics::try_metrics() else {
            return Ok(());
        };

        let snapshot = self.queue_snapshot().await?;
        let jobs = snapshot.queue.newsletter;

        metrics
            .queue
            .set_job_counts([jobs.pending, jobs.in_progress, jobs.sent, jobs.failed, jobs.dead]);
        metrics.queue.set_dlq_depth(snapshot.queue.dlq.active);
        metrics.queue.set_in_flight(snapshot.backpressure.active_jobs);
        metrics.queue.set_circuit_state(snapshot.circuit.state.as_gauge());

        Ok(())
    }
}
