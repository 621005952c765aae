//! Enqueue API used by upstream business logic
//!
//! Every producer validates synchronously and returns as soon as the job is
//! queued. Outcomes are observed through the stats aggregator.

use std::{sync::Arc, time::UNIX_EPOCH};

use chrono::NaiveDate;
use dashmap::DashSet;
use herald_queue::{EnqueueOptions, Enqueued, JobPayload, JobStore};
use serde::{Deserialize, Serialize};

use crate::{
    campaign::{CampaignStatus, CampaignStore},
    error::{CampaignStoreError, ProducerError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub campaign_id: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub comment_id: String,
    pub original_status: String,
    pub new_status: String,
    pub admin_id: String,
    pub reason: Option<String>,
}

/// Result of fanning a campaign out into recipient jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutSummary {
    pub jobs_created: u64,
    /// Recipients that already had a job
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct Producer {
    jobs: Arc<dyn JobStore>,
    campaigns: Arc<dyn CampaignStore>,
    paused: Arc<DashSet<String>>,
}

impl Producer {
    pub fn new(jobs: Arc<dyn JobStore>, campaigns: Arc<dyn CampaignStore>) -> Self {
        Self {
            jobs,
            campaigns,
            paused: Arc::new(DashSet::new()),
        }
    }

    /// Queue generation of the newsletter draft for `date`
    ///
    /// # Errors
    ///
    /// Fails only if the queue rejects the job.
    pub async fn enqueue_newsletter_draft(&self, date: NaiveDate) -> Result<Enqueued, ProducerError> {
        let enqueued = self
            .jobs
            .enqueue(
                JobPayload::DraftGeneration { date },
                EnqueueOptions::deduped(format!("draft:{date}")),
            )
            .await?;

        tracing::info!(job_id = %enqueued.job_id, %date, created = enqueued.created, "Draft generation queued");

        Ok(enqueued)
    }

    /// Accept a publish request; the fan-out happens on a worker
    ///
    /// # Errors
    ///
    /// Rejects unknown, paused, sending or sent campaigns before anything is
    /// queued.
    pub async fn enqueue_publish(&self, request: PublishRequest) -> Result<Enqueued, ProducerError> {
        if request.campaign_id.trim().is_empty() || request.operator_id.trim().is_empty() {
            return Err(ProducerError::Validation(
                "campaign_id and operator_id are required".to_string(),
            ));
        }

        let campaign = self.campaigns.get_campaign(&request.campaign_id).await?;

        if matches!(campaign.status, CampaignStatus::Sending | CampaignStatus::Sent) {
            return Err(ProducerError::InvalidState {
                campaign_id: campaign.id,
                status: campaign.status,
            });
        }

        if self.is_paused(&campaign.id) {
            return Err(ProducerError::Paused(campaign.id));
        }

        // One publish job per campaign revision
        let revision = campaign
            .updated_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_millis());
        let key = format!("publish:{}:{revision}", campaign.id);

        let enqueued = self
            .jobs
            .enqueue(
                JobPayload::Publish {
                    campaign_id: request.campaign_id,
                    operator_id: request.operator_id.clone(),
                },
                EnqueueOptions::deduped(key),
            )
            .await?;

        tracing::info!(
            job_id = %enqueued.job_id,
            campaign_id = %campaign.id,
            operator_id = %request.operator_id,
            created = enqueued.created,
            "Publish accepted"
        );

        Ok(enqueued)
    }

    /// Create one recipient job per eligible subscriber, then mark the
    /// campaign as sending
    ///
    /// The campaign only becomes `sending` once every recipient job exists, so
    /// workers draining the first jobs can never finish it early. A fan-out cut
    /// short by a pause leaves the campaign in its previous status; running it
    /// again after resume creates the missing jobs and skips the rest.
    ///
    /// # Errors
    ///
    /// [`ProducerError::NoEligibleSubscribers`] after marking the campaign
    /// failed, [`ProducerError::Paused`] if the campaign was paused before or
    /// during the fan-out.
    pub async fn fan_out_campaign(&self, campaign_id: &str) -> Result<FanOutSummary, ProducerError> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?;

        if campaign.status == CampaignStatus::Sent {
            return Err(ProducerError::InvalidState {
                campaign_id: campaign.id,
                status: campaign.status,
            });
        }

        if self.is_paused(campaign_id) {
            return Err(ProducerError::Paused(campaign_id.to_string()));
        }

        let subscribers = self.campaigns.eligible_subscribers(campaign.audience).await?;

        if subscribers.is_empty() {
            if campaign.status != CampaignStatus::Failed {
                self.campaigns
                    .transition(campaign_id, campaign.status, CampaignStatus::Failed)
                    .await?;
            }

            tracing::warn!(campaign_id, "Campaign has no eligible subscribers");
            return Err(ProducerError::NoEligibleSubscribers(campaign_id.to_string()));
        }

        let mut summary = FanOutSummary::default();

        for subscriber in subscribers {
            if self.is_paused(campaign_id) {
                tracing::info!(campaign_id, jobs_created = summary.jobs_created, "Fan-out paused");
                return Err(ProducerError::Paused(campaign_id.to_string()));
            }

            let key = JobPayload::delivery_key(campaign_id, &subscriber.id);
            let enqueued = self
                .jobs
                .enqueue(
                    JobPayload::Delivery {
                        campaign_id: campaign_id.to_string(),
                        subscriber_id: subscriber.id,
                    },
                    EnqueueOptions::deduped(key),
                )
                .await?;

            if enqueued.created {
                summary.jobs_created += 1;
            } else {
                summary.skipped += 1;
            }
        }

        if campaign.status != CampaignStatus::Sending {
            match self
                .campaigns
                .transition(campaign_id, campaign.status, CampaignStatus::Sending)
                .await
            {
                Ok(_) => {}
                // Another worker completed the same fan-out first
                Err(CampaignStoreError::InvalidTransition {
                    actual: CampaignStatus::Sending,
                    ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            campaign_id,
            jobs_created = summary.jobs_created,
            skipped = summary.skipped,
            "Campaign fanned out"
        );

        Ok(summary)
    }

    /// Queue a comment moderation decision for the feedback consumer
    ///
    /// # Errors
    ///
    /// [`ProducerError::Validation`] for empty ids or an unchanged status.
    pub async fn enqueue_feedback(&self, request: FeedbackRequest) -> Result<Enqueued, ProducerError> {
        if request.comment_id.trim().is_empty() {
            return Err(ProducerError::Validation("comment_id is required".to_string()));
        }
        if request.admin_id.trim().is_empty() {
            return Err(ProducerError::Validation("admin_id is required".to_string()));
        }
        if request.original_status == request.new_status {
            return Err(ProducerError::Validation(format!(
                "status unchanged: {}",
                request.new_status
            )));
        }

        let enqueued = self
            .jobs
            .enqueue(
                JobPayload::Feedback {
                    comment_id: request.comment_id,
                    original_status: request.original_status,
                    new_status: request.new_status,
                    admin_id: request.admin_id,
                    reason: request.reason,
                },
                EnqueueOptions::default(),
            )
            .await?;

        Ok(enqueued)
    }

    /// Stop fanning out a campaign. Already queued recipient jobs still drain.
    pub fn pause_campaign(&self, campaign_id: &str) -> bool {
        let inserted = self.paused.insert(campaign_id.to_string());
        if inserted {
            tracing::info!(campaign_id, "Campaign paused");
        }
        inserted
    }

    pub fn resume_campaign(&self, campaign_id: &str) -> bool {
        let removed = self.paused.remove(campaign_id).is_some();
        if removed {
            tracing::info!(campaign_id, "Campaign resumed");
        }
        removed
    }

    #[must_use]
    pub fn is_paused(&self, campaign_id: &str) -> bool {
        self.paused.contains(campaign_id)
    }
}

#[cfg(test)]
mod tests {
    use herald_queue::{JobFilter, JobStatus, MemoryJobStore};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::campaign::{Audience, Campaign, MemoryCampaignStore, Subscriber, SubscriberStatus};

    fn setup(subscribers: usize) -> (Producer, Arc<MemoryJobStore>, Arc<MemoryCampaignStore>) {
        let jobs = Arc::new(MemoryJobStore::default());
        let campaigns = Arc::new(MemoryCampaignStore::new());

        campaigns.insert_campaign(Campaign::draft("c1", "Weekly", "Hello", Audience::All));
        for i in 0..subscribers {
            campaigns.insert_subscriber(Subscriber::new(
                format!("s{i}"),
                format!("reader{i}@example.com"),
                SubscriberStatus::Verified,
            ));
        }

        let producer = Producer::new(jobs.clone(), campaigns.clone());
        (producer, jobs, campaigns)
    }

    fn publish(campaign_id: &str) -> PublishRequest {
        PublishRequest {
            campaign_id: campaign_id.to_string(),
            operator_id: "op-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_creates_one_job_per_subscriber() {
        let (producer, jobs, campaigns) = setup(3);

        let summary = producer.fan_out_campaign("c1").await.unwrap();
        assert_eq!(
            summary,
            FanOutSummary {
                jobs_created: 3,
                skipped: 0
            }
        );

        let counts = jobs.counts(&JobFilter::campaign("c1")).await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(
            campaigns.get_campaign("c1").await.unwrap().status,
            CampaignStatus::Sending
        );
    }

    #[tokio::test]
    async fn test_fan_out_twice_is_idempotent() {
        let (producer, jobs, _) = setup(2);

        producer.fan_out_campaign("c1").await.unwrap();
        let again = producer.fan_out_campaign("c1").await.unwrap();

        assert_eq!(again.jobs_created, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_without_subscribers_fails_campaign() {
        let (producer, jobs, campaigns) = setup(0);

        let err = producer.fan_out_campaign("c1").await.unwrap_err();
        assert!(matches!(err, ProducerError::NoEligibleSubscribers(_)));
        assert_eq!(
            campaigns.get_campaign("c1").await.unwrap().status,
            CampaignStatus::Failed
        );
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_and_sending() {
        let (producer, jobs, campaigns) = setup(1);

        assert!(matches!(
            producer.enqueue_publish(publish("missing")).await,
            Err(ProducerError::CampaignNotFound(_))
        ));

        campaigns
            .transition("c1", CampaignStatus::Draft, CampaignStatus::Sending)
            .await
            .unwrap();
        assert!(matches!(
            producer.enqueue_publish(publish("c1")).await,
            Err(ProducerError::InvalidState {
                status: CampaignStatus::Sending,
                ..
            })
        ));

        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_publish_is_deduped_per_revision() {
        let (producer, jobs, _) = setup(1);

        let first = producer.enqueue_publish(publish("c1")).await.unwrap();
        let second = producer.enqueue_publish(publish("c1")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(jobs.len(), 1);

        let job = jobs.get(&first.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_paused_campaign_is_not_fanned_out() {
        let (producer, jobs, _) = setup(2);

        assert!(producer.pause_campaign("c1"));
        assert!(!producer.pause_campaign("c1"));

        assert!(matches!(
            producer.enqueue_publish(publish("c1")).await,
            Err(ProducerError::Paused(_))
        ));
        assert!(matches!(
            producer.fan_out_campaign("c1").await,
            Err(ProducerError::Paused(_))
        ));
        assert!(jobs.is_empty());

        assert!(producer.resume_campaign("c1"));
        assert_eq!(producer.fan_out_campaign("c1").await.unwrap().jobs_created, 2);
    }

    #[tokio::test]
    async fn test_interrupted_fan_out_completes_on_rerun() {
        let (producer, jobs, campaigns) = setup(3);

        // Left behind by a fan-out that stopped after the first recipient
        jobs.enqueue(
            JobPayload::Delivery {
                campaign_id: "c1".to_string(),
                subscriber_id: "s0".to_string(),
            },
            EnqueueOptions::deduped(JobPayload::delivery_key("c1", "s0")),
        )
        .await
        .unwrap();
        assert_eq!(
            campaigns.get_campaign("c1").await.unwrap().status,
            CampaignStatus::Draft
        );

        let summary = producer.fan_out_campaign("c1").await.unwrap();
        assert_eq!(
            summary,
            FanOutSummary {
                jobs_created: 2,
                skipped: 1
            }
        );
        assert_eq!(jobs.len(), 3);
        assert_eq!(
            campaigns.get_campaign("c1").await.unwrap().status,
            CampaignStatus::Sending
        );
    }

    #[tokio::test]
    async fn test_feedback_validation() {
        let (producer, jobs, _) = setup(0);

        let request = FeedbackRequest {
            comment_id: "cm-1".to_string(),
            original_status: "pending".to_string(),
            new_status: "pending".to_string(),
            admin_id: "admin".to_string(),
            reason: None,
        };
        assert!(matches!(
            producer.enqueue_feedback(request.clone()).await,
            Err(ProducerError::Validation(_))
        ));

        let missing_admin = FeedbackRequest {
            admin_id: " ".to_string(),
            new_status: "approved".to_string(),
            ..request.clone()
        };
        assert!(matches!(
            producer.enqueue_feedback(missing_admin).await,
            Err(ProducerError::Validation(_))
        ));
        assert!(jobs.is_empty());

        let valid = FeedbackRequest {
            new_status: "approved".to_string(),
            reason: Some("spam filter false positive".to_string()),
            ..request
        };
        let enqueued = producer.enqueue_feedback(valid).await.unwrap();
        assert!(enqueued.created);
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_draft_deduped_per_day() {
        let (producer, jobs, _) = setup(0);
        let date = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();

        let first = producer.enqueue_newsletter_draft(date).await.unwrap();
        let second = producer.enqueue_newsletter_draft(date).await.unwrap();

        assert_eq!(first.job_id, second.job_id);
        assert_eq!(jobs.len(), 1);
    }
}
