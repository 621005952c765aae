//! Control handler for a running herald instance
//!
//! Every request is authorized first. Commands that change state write one
//! audit record each, whether they were denied, failed or succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use herald_common::audit::{AuditOutcome, AuditRecord, AuditSink};
use herald_control::{
    AuthError, Authorizer, CommandHandler, ControlError, NewsletterCommand, Principal, Request,
    RequestCommand, Response, ResponseData, SystemCommand, auth::ANONYMOUS_ACTOR,
};
use herald_delivery::{
    CircuitBreaker, CircuitState, DeliveryProcessor, Producer, PublishRequest, StatsAggregator,
};
use herald_queue::{JobId, JobStore};

/// Upper bound on rows returned by list commands
const MAX_LIST_LIMIT: usize = 500;

/// Handler for control commands
pub struct HeraldControlHandler {
    jobs: Arc<dyn JobStore>,
    breaker: Arc<CircuitBreaker>,
    producer: Producer,
    stats: StatsAggregator,
    auth: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
}

impl HeraldControlHandler {
    #[must_use]
    pub fn new(
        processor: &DeliveryProcessor,
        stats: StatsAggregator,
        auth: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            jobs: processor.queue(),
            breaker: processor.breaker(),
            producer: processor.producer().clone(),
            stats,
            auth,
            audit,
        }
    }

    fn record_audit(&self, actor: &str, command: &RequestCommand, outcome: AuditOutcome) {
        if let Some(action) = command.audit_action() {
            self.audit
                .record(AuditRecord::new(actor, action, command.audit_target(), outcome));
        }
    }

    async fn dispatch(
        &self,
        principal: &Principal,
        command: RequestCommand,
    ) -> herald_control::Result<Response> {
        match command {
            RequestCommand::System(SystemCommand::Ping) => Ok(Response::ok()),
            RequestCommand::Newsletter(command) => self.newsletter(principal, command).await,
        }
    }

    async fn newsletter(
        &self,
        principal: &Principal,
        command: NewsletterCommand,
    ) -> herald_control::Result<Response> {
        let data = match command {
            NewsletterCommand::Stats { campaign_id } => ResponseData::Stats(
                self.stats
                    .delivery_stats(campaign_id.as_deref())
                    .await
                    .map_err(server_error)?,
            ),

            NewsletterCommand::FailedJobs { limit } => ResponseData::FailedJobs(
                self.stats
                    .failed_jobs(limit.clamp(1, MAX_LIST_LIMIT))
                    .await
                    .map_err(server_error)?,
            ),

            NewsletterCommand::RetryFailedJob { job_id } => {
                let id: JobId = job_id
                    .parse()
                    .map_err(|e| ControlError::ServerError(format!("Invalid job id {job_id}: {e}")))?;
                self.jobs.requeue_from_dlq(&id).await.map_err(server_error)?;
                tracing::info!(job_id = %id, actor = %principal.actor, "Dead job requeued");
                ResponseData::JobAccepted {
                    job_id: id.to_string(),
                }
            }

            NewsletterCommand::ResetCircuitBreaker => {
                self.breaker.reset();
                if let Some(metrics) = herald_metrics::try_metrics() {
                    metrics.delivery.record_breaker_transition(&CircuitState::Closed.to_string());
                }
                ResponseData::Circuit(self.breaker.snapshot())
            }

            NewsletterCommand::QueueMetrics => {
                ResponseData::QueueMetrics(self.stats.queue_snapshot().await.map_err(server_error)?)
            }

            NewsletterCommand::Campaigns { limit } => ResponseData::Campaigns(
                self.stats
                    .recent_campaigns(limit.clamp(1, MAX_LIST_LIMIT))
                    .await
                    .map_err(server_error)?,
            ),

            NewsletterCommand::Publish { campaign_id } => {
                let enqueued = self
                    .producer
                    .enqueue_publish(PublishRequest {
                        campaign_id,
                        operator_id: principal.actor.clone(),
                    })
                    .await
                    .map_err(server_error)?;
                ResponseData::JobAccepted {
                    job_id: enqueued.job_id.to_string(),
                }
            }

            NewsletterCommand::GenerateDraft { date } => {
                let enqueued = self
                    .producer
                    .enqueue_newsletter_draft(date)
                    .await
                    .map_err(server_error)?;
                ResponseData::JobAccepted {
                    job_id: enqueued.job_id.to_string(),
                }
            }
        };

        Ok(Response::data(data))
    }
}

fn server_error(e: impl std::fmt::Display) -> ControlError {
    ControlError::ServerError(e.to_string())
}

#[async_trait]
impl CommandHandler for HeraldControlHandler {
    async fn handle_request(&self, request: Request) -> herald_control::Result<Response> {
        let principal = match self
            .auth
            .authorize(request.token.as_deref(), request.command.permission())
        {
            Ok(principal) => principal,
            Err(e) => {
                let actor = match &e {
                    AuthError::Forbidden { actor, .. } => actor.as_str(),
                    AuthError::MissingToken | AuthError::InvalidToken => ANONYMOUS_ACTOR,
                };
                tracing::warn!(actor = %actor, error = %e, "Control request denied");
                self.record_audit(actor, &request.command, AuditOutcome::Denied(e.to_string()));
                return Err(e.into());
            }
        };

        let command = request.command.clone();
        let result = self.dispatch(&principal, request.command).await;

        if command.is_mutating() {
            let outcome = match &result {
                Ok(_) => AuditOutcome::Success,
                Err(e) => AuditOutcome::Failed(e.to_string()),
            };
            self.record_audit(&principal.actor, &command, outcome);
        }

        result
    }
}
