//! Per-job processing
//!
//! Every job ends in exactly one queue operation: `ack`, `fail`,
//! `dead_letter` or `release`. Handlers only decide which; errors never leave
//! the job boundary except for queue failures.

use std::time::{Duration, Instant, SystemTime};

use herald_common::audit;
use herald_metrics::DeferReason;
use herald_queue::{ClaimedJob, FailOutcome, JobFilter, JobPayload, QueueError, WorkerId};
use serde::{Deserialize, Serialize};

use super::DeliveryProcessor;
use crate::{
    backpressure::QueueTicket,
    campaign::{Campaign, CampaignStatus, SubscriberStatus},
    circuit_breaker::Admission,
    error::{
        CampaignStoreError, DeliveryError, PermanentError, ProducerError, SystemError,
        TemporaryError,
    },
    handlers::ModerationFeedback,
    transport::OutboundMessage,
};

/// Why a job was handed back without using an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferCause {
    CircuitOpen,
    Backpressure,
    CampaignPaused,
}

/// What happened to a claimed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    Retrying {
        attempts: u32,
        next_retry_at: SystemTime,
    },
    DeadLettered {
        attempts: u32,
    },
    Deferred(DeferCause),
}

impl JobOutcome {
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::DeadLettered { .. })
    }
}

enum Disposition {
    /// Done; carries the time spent in the collaborator
    Ack(Duration),
    Retry(DeliveryError),
    DeadLetter(DeliveryError),
    Release(Duration, DeferCause),
}

impl From<DeliveryError> for Disposition {
    fn from(error: DeliveryError) -> Self {
        if error.is_permanent() {
            Self::DeadLetter(error)
        } else {
            Self::Retry(error)
        }
    }
}

impl DeliveryProcessor {
    /// Claim one job and drive it to an outcome
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    ///
    /// # Errors
    ///
    /// Only queue errors escape. [`QueueError::is_fatal`] tells the caller
    /// whether to stop.
    pub async fn process_next(&self, worker: &WorkerId) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.dequeue(worker).await? else {
            return Ok(None);
        };
        let ticket = self.backpressure.queue_ticket();

        tracing::debug!(
            job_id = %job.id,
            job_type = %job.payload.job_type(),
            worker = %worker,
            attempts = job.attempts,
            "Claimed job"
        );

        let disposition = match &job.payload {
            JobPayload::Delivery {
                campaign_id,
                subscriber_id,
            } => self.deliver(&job, campaign_id, subscriber_id, ticket).await,
            JobPayload::Publish { campaign_id, .. } => {
                drop(ticket);
                self.publish(campaign_id).await?
            }
            JobPayload::DraftGeneration { date } => {
                drop(ticket);
                let started = Instant::now();
                match self.drafts.generate(*date).await {
                    Ok(()) => Disposition::Ack(started.elapsed()),
                    Err(e) => e.into(),
                }
            }
            JobPayload::Feedback {
                comment_id,
                original_status,
                new_status,
                admin_id,
                reason,
            } => {
                drop(ticket);
                let feedback = ModerationFeedback {
                    comment_id: comment_id.clone(),
                    original_status: original_status.clone(),
                    new_status: new_status.clone(),
                    admin_id: admin_id.clone(),
                    reason: reason.clone(),
                };
                let started = Instant::now();
                match self.feedback.apply(&feedback).await {
                    Ok(()) => Disposition::Ack(started.elapsed()),
                    Err(e) => e.into(),
                }
            }
        };

        let outcome = self.apply(&job, disposition).await?;

        if outcome.is_terminal()
            && let Some(campaign_id) = job.payload.campaign_id()
        {
            self.finalize_campaign(campaign_id).await?;
        }

        Ok(Some(outcome))
    }

    /// Send one campaign to one subscriber
    async fn deliver(
        &self,
        job: &ClaimedJob,
        campaign_id: &str,
        subscriber_id: &str,
        ticket: QueueTicket,
    ) -> Disposition {
        let (campaign, to) = match self.load_recipient(campaign_id, subscriber_id).await {
            Ok(found) => found,
            Err(e) => return e.into(),
        };

        let Some(admission) = self.breaker.allow_request() else {
            return Disposition::Release(
                Duration::from_secs(self.config.breaker_defer_secs),
                DeferCause::CircuitOpen,
            );
        };

        let Some(_permit) = self.backpressure.try_acquire() else {
            // A half-open probe slot must not leak with the released job
            self.breaker.record_ignored(admission);
            return Disposition::Release(
                Duration::from_secs(self.config.backpressure_defer_secs),
                DeferCause::Backpressure,
            );
        };
        drop(ticket);

        let attempt = job.attempts + 1;
        let job_id = job.id.to_string();
        audit::log_delivery_attempt(&job_id, campaign_id, &to, attempt);

        let message = OutboundMessage {
            job_id: job.id,
            campaign_id: campaign.id,
            subscriber_id: subscriber_id.to_string(),
            to,
            subject: campaign.subject,
            body: campaign.body,
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.transport_timeout(), self.transport.send(&message)).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(())) => {
                if self.breaker.record_success(admission) {
                    self.publish_breaker_transition();
                }
                Disposition::Ack(elapsed)
            }
            Ok(Err(e)) if e.is_permanent() => {
                self.breaker.record_ignored(admission);
                Disposition::DeadLetter(e.into())
            }
            Ok(Err(e)) => {
                self.record_transport_failure(admission, elapsed);
                Disposition::Retry(e.into())
            }
            Err(_) => {
                self.record_transport_failure(admission, elapsed);
                Disposition::Retry(
                    TemporaryError::Timeout(format!(
                        "no response within {}s",
                        self.config.transport_timeout_secs
                    ))
                    .into(),
                )
            }
        }
    }

    /// Resolve the campaign and a deliverable address for the subscriber
    async fn load_recipient(
        &self,
        campaign_id: &str,
        subscriber_id: &str,
    ) -> Result<(Campaign, String), DeliveryError> {
        let campaign = self
            .campaigns
            .get_campaign(campaign_id)
            .await
            .map_err(|e| match e {
                CampaignStoreError::NotFound(id) => {
                    DeliveryError::from(PermanentError::CampaignNotFound(id))
                }
                other => SystemError::Store(other.to_string()).into(),
            })?;

        let subscriber = self
            .campaigns
            .get_subscriber(subscriber_id)
            .await
            .map_err(|e| SystemError::Store(e.to_string()))?
            .ok_or_else(|| PermanentError::SubscriberNotFound(subscriber_id.to_string()))?;

        if subscriber.status == SubscriberStatus::Unsubscribed {
            return Err(PermanentError::Unsubscribed(subscriber.id).into());
        }

        let address = parse_recipient(&subscriber.email).ok_or_else(|| {
            PermanentError::InvalidRecipient(audit::mask_email(&subscriber.email))
        })?;

        Ok((campaign, address))
    }

    /// Fan a campaign out on behalf of a publish job
    async fn publish(&self, campaign_id: &str) -> Result<Disposition, QueueError> {
        let started = Instant::now();

        let disposition = match self.producer.fan_out_campaign(campaign_id).await {
            Ok(_) => Disposition::Ack(started.elapsed()),
            // The campaign is marked failed; there is nothing left to do
            Err(ProducerError::NoEligibleSubscribers(_)) => Disposition::Ack(started.elapsed()),
            Err(ProducerError::Paused(_)) => Disposition::Release(
                Duration::from_secs(self.config.pause_defer_secs),
                DeferCause::CampaignPaused,
            ),
            Err(ProducerError::CampaignNotFound(id)) => {
                Disposition::DeadLetter(PermanentError::CampaignNotFound(id).into())
            }
            Err(e @ (ProducerError::InvalidState { .. } | ProducerError::Validation(_))) => {
                Disposition::DeadLetter(PermanentError::InvalidJob(e.to_string()).into())
            }
            Err(ProducerError::Queue(e)) if e.is_fatal() => return Err(e),
            Err(ProducerError::Queue(e)) => Disposition::Retry(e.into()),
            Err(ProducerError::Store(msg)) => Disposition::Retry(SystemError::Store(msg).into()),
        };

        Ok(disposition)
    }

    /// Record the disposition in the queue, metrics and audit log
    async fn apply(&self, job: &ClaimedJob, disposition: Disposition) -> Result<JobOutcome, QueueError> {
        let job_type = job.payload.job_type().to_string();
        let job_id = job.id.to_string();
        let campaign_id = job.payload.campaign_id().unwrap_or("-");
        let is_delivery = matches!(job.payload, JobPayload::Delivery { .. });
        let metrics = herald_metrics::try_metrics();

        let outcome = match disposition {
            Disposition::Ack(elapsed) => {
                self.queue.ack(job).await?;

                if let Some(metrics) = metrics {
                    metrics.delivery.record_sent(&job_type, elapsed.as_secs_f64());
                }
                if is_delivery {
                    audit::log_delivery_success(&job_id, campaign_id, job.attempts + 1, elapsed.as_millis());
                }
                tracing::info!(job_id = %job_id, job_type = %job_type, "Job completed");

                JobOutcome::Sent
            }
            Disposition::Retry(error) => {
                let reason = error.to_string();

                match self.queue.fail(job, &reason).await? {
                    FailOutcome::Retry {
                        next_retry_at,
                        attempts,
                    } => {
                        if let Some(metrics) = metrics {
                            metrics.delivery.record_retry(&job_type);
                        }
                        if is_delivery {
                            audit::log_delivery_failure(&job_id, campaign_id, &reason, attempts, "failed");
                        }
                        tracing::warn!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempts,
                            retry_in_secs = next_retry_at
                                .duration_since(SystemTime::now())
                                .unwrap_or_default()
                                .as_secs(),
                            error = %reason,
                            "Job failed, retry scheduled"
                        );

                        JobOutcome::Retrying {
                            attempts,
                            next_retry_at,
                        }
                    }
                    FailOutcome::DeadLettered { attempts } => {
                        if let Some(metrics) = metrics {
                            metrics.delivery.record_dead_letter(&job_type, "exhausted");
                        }
                        if is_delivery {
                            audit::log_delivery_failure(&job_id, campaign_id, &reason, attempts, "dead");
                        }

                        JobOutcome::DeadLettered { attempts }
                    }
                }
            }
            Disposition::DeadLetter(error) => {
                let reason = error.to_string();
                self.queue.dead_letter(job, &reason).await?;
                let attempts = job.attempts + 1;

                if let Some(metrics) = metrics {
                    metrics.delivery.record_dead_letter(&job_type, "permanent");
                }
                if is_delivery {
                    audit::log_delivery_failure(&job_id, campaign_id, &reason, attempts, "dead");
                }

                JobOutcome::DeadLettered { attempts }
            }
            Disposition::Release(delay, cause) => {
                self.queue.release(job, delay).await?;

                if let Some(metrics) = metrics {
                    match cause {
                        DeferCause::CircuitOpen => metrics.delivery.record_deferred(DeferReason::CircuitOpen),
                        DeferCause::Backpressure => metrics.delivery.record_deferred(DeferReason::Backpressure),
                        DeferCause::CampaignPaused => {}
                    }
                }
                tracing::debug!(job_id = %job_id, job_type = %job_type, ?cause, delay_ms = delay.as_millis(), "Job deferred");

                JobOutcome::Deferred(cause)
            }
        };

        Ok(outcome)
    }

    /// Mark a sending campaign as sent once none of its recipient jobs can
    /// change any more
    ///
    /// Returns `true` if this call made the transition. A campaign store
    /// failure leaves the campaign sending for
    /// [`finalize_stalled_campaigns`](Self::finalize_stalled_campaigns) to
    /// pick up.
    ///
    /// # Errors
    ///
    /// Fails only if the queue cannot be counted.
    pub async fn finalize_campaign(&self, campaign_id: &str) -> Result<bool, QueueError> {
        let counts = self.queue.counts(&JobFilter::campaign(campaign_id)).await?;

        if counts.total() == 0 || counts.non_terminal() > 0 {
            return Ok(false);
        }

        match self
            .campaigns
            .transition(campaign_id, CampaignStatus::Sending, CampaignStatus::Sent)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    campaign_id,
                    sent = counts.sent,
                    dead = counts.dead,
                    "Campaign delivery finished"
                );
                Ok(true)
            }
            // Another worker finished it first
            Err(CampaignStoreError::InvalidTransition { .. }) => Ok(false),
            Err(e) => {
                tracing::warn!(campaign_id, error = %e, "Could not finalize campaign, leaving it to the sweep");
                Ok(false)
            }
        }
    }

    /// Finalize every sending campaign whose recipient jobs are all terminal
    ///
    /// Returns how many campaigns this call moved to sent.
    ///
    /// # Errors
    ///
    /// Fails only if the queue cannot be counted.
    pub async fn finalize_stalled_campaigns(&self) -> Result<usize, QueueError> {
        let campaigns = match self.campaigns.list_campaigns(usize::MAX).await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list campaigns to finalize");
                return Ok(0);
            }
        };

        let mut finalized = 0;
        for campaign in campaigns
            .iter()
            .filter(|campaign| campaign.status == CampaignStatus::Sending)
        {
            if self.finalize_campaign(&campaign.id).await? {
                finalized += 1;
            }
        }

        Ok(finalized)
    }

    fn record_transport_failure(&self, admission: Admission, elapsed: Duration) {
        let tripped = self.breaker.record_failure(admission);

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.delivery.record_transport_failure(elapsed.as_secs_f64());
        }
        if tripped {
            self.publish_breaker_transition();
        }
    }

    fn publish_breaker_transition(&self) {
        let state = self.breaker.state();

        if let Some(metrics) = herald_metrics::try_metrics() {
            metrics.delivery.record_breaker_transition(&state.to_string());
            metrics.queue.set_circuit_state(state.as_gauge());
        }
    }
}

/// A single well-formed address, or `None`
fn parse_recipient(email: &str) -> Option<String> {
    let list = mailparse::addrparse(email.trim()).ok()?;

    match list.first() {
        Some(mailparse::MailAddr::Single(info)) if list.len() == 1 => {
            let (local, domain) = info.addr.rsplit_once('@')?;
            (!local.is_empty() && !domain.is_empty()).then(|| info.addr.clone())
        }
        _ => None,
    }
}
