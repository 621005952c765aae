//! Messages exchanged over the control socket
//!
//! Every frame carries [`PROTOCOL_VERSION`]; peers only talk to an exact match.

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, NaiveDate, Utc};
use herald_delivery::{CampaignSummary, CircuitSnapshot, DeliveryStats, FailedJob, QueueSnapshot};
use serde::{Deserialize, Serialize};

use crate::auth::Permission;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    /// Bearer token; checked against the configured hashes when auth is on
    #[serde(default)]
    pub token: Option<String>,
    pub command: RequestCommand,
}

/// Request command types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    /// Liveness commands
    System(SystemCommand),
    /// Newsletter pipeline commands
    Newsletter(NewsletterCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewsletterCommand {
    /// Delivery totals for one campaign, or for every recipient job
    Stats { campaign_id: Option<String> },
    /// Most recent dead letter entries, recipients masked
    FailedJobs { limit: usize },
    /// Move one dead job back to pending
    RetryFailedJob { job_id: String },
    /// Force the circuit breaker closed
    ResetCircuitBreaker,
    /// Queue depths, totals, breaker and backpressure in one snapshot
    QueueMetrics,
    /// Most recent campaigns with their delivery totals
    Campaigns { limit: usize },
    /// Queue a campaign for sending
    Publish { campaign_id: String },
    /// Queue draft generation for a date
    GenerateDraft { date: NaiveDate },
}

impl RequestCommand {
    /// Permission the caller must hold to run this command
    #[must_use]
    pub const fn permission(&self) -> Permission {
        match self {
            Self::System(SystemCommand::Ping) => Permission::Read,
            Self::Newsletter(command) => match command {
                NewsletterCommand::Stats { .. }
                | NewsletterCommand::FailedJobs { .. }
                | NewsletterCommand::QueueMetrics
                | NewsletterCommand::Campaigns { .. } => Permission::Read,
                NewsletterCommand::RetryFailedJob { .. } | NewsletterCommand::ResetCircuitBreaker => {
                    Permission::Manage
                }
                NewsletterCommand::Publish { .. } | NewsletterCommand::GenerateDraft { .. } => {
                    Permission::Publish
                }
            },
        }
    }

    /// Audit action name, for commands that change state
    #[must_use]
    pub const fn audit_action(&self) -> Option<&'static str> {
        match self {
            Self::Newsletter(NewsletterCommand::RetryFailedJob { .. }) => Some("newsletter.retry"),
            Self::Newsletter(NewsletterCommand::ResetCircuitBreaker) => {
                Some("newsletter.reset_circuit")
            }
            Self::Newsletter(NewsletterCommand::Publish { .. }) => Some("newsletter.publish"),
            Self::Newsletter(NewsletterCommand::GenerateDraft { .. }) => {
                Some("newsletter.generate_draft")
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        self.audit_action().is_some()
    }

    /// Audit target, e.g. `job:01J...` or `campaign:spring`
    #[must_use]
    pub fn audit_target(&self) -> Option<String> {
        match self {
            Self::Newsletter(NewsletterCommand::RetryFailedJob { job_id }) => {
                Some(format!("job:{job_id}"))
            }
            Self::Newsletter(NewsletterCommand::ResetCircuitBreaker) => {
                Some("circuit:transport".to_string())
            }
            Self::Newsletter(NewsletterCommand::Publish { campaign_id }) => {
                Some(format!("campaign:{campaign_id}"))
            }
            Self::Newsletter(NewsletterCommand::GenerateDraft { date }) => {
                Some(format!("draft:{date}"))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Ok,
    Data(Box<ResponseData>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Stats(DeliveryStats),
    FailedJobs(Vec<FailedJob>),
    QueueMetrics(QueueSnapshot),
    Campaigns(Vec<CampaignSummary>),
    /// Breaker state after a reset
    Circuit(CircuitSnapshot),
    /// A job was queued or requeued
    JobAccepted { job_id: String },
    Message(String),
}

/// Wrapper for printing [`ResponseData`] to an operator terminal
pub struct Report<'a>(pub &'a ResponseData);

fn format_time(at: impl Into<DateTime<Utc>>) -> String {
    at.into().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn write_stats(f: &mut Formatter<'_>, stats: &DeliveryStats) -> fmt::Result {
    writeln!(f, "Sent:      {}", stats.sent)?;
    writeln!(f, "Failed:    {}", stats.failed)?;
    writeln!(f, "Pending:   {}", stats.pending)?;
    writeln!(f, "Total:     {}", stats.total)?;
    writeln!(f, "Success:   {:.1}%", stats.success_rate)
}

fn write_circuit(f: &mut Formatter<'_>, circuit: &CircuitSnapshot) -> fmt::Result {
    writeln!(f, "Circuit:   {}", circuit.state)?;
    writeln!(
        f,
        "Failures:  {}/{} in {}s",
        circuit.failure_count, circuit.failure_threshold, circuit.failure_window_secs
    )?;
    if let Some(at) = circuit.last_failure_at {
        writeln!(f, "Last failure: {}", format_time(at))?;
    }
    Ok(())
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            ResponseData::Stats(stats) => write_stats(f, stats),
            ResponseData::FailedJobs(jobs) if jobs.is_empty() => {
                writeln!(f, "Dead letter queue is empty")
            }
            ResponseData::FailedJobs(jobs) => {
                for job in jobs {
                    writeln!(f, "ID:        {}", job.job_id)?;
                    writeln!(f, "Type:      {:?}", job.job_type)?;
                    if let Some(campaign) = &job.campaign_id {
                        writeln!(f, "Campaign:  {campaign}")?;
                    }
                    if let Some(recipient) = &job.recipient {
                        writeln!(f, "Recipient: {recipient}")?;
                    }
                    writeln!(f, "Attempts:  {}", job.attempts)?;
                    writeln!(f, "Error:     {}", job.error)?;
                    writeln!(f, "Dead at:   {}\n", format_time(job.dead_at))?;
                }
                Ok(())
            }
            ResponseData::QueueMetrics(snapshot) => {
                let counts = &snapshot.queue.newsletter;
                writeln!(
                    f,
                    "Queue:     pending={} in_progress={} sent={} failed={} dead={}",
                    counts.pending, counts.in_progress, counts.sent, counts.failed, counts.dead
                )?;
                writeln!(
                    f,
                    "DLQ:       active={} requeued={}",
                    snapshot.queue.dlq.active, snapshot.queue.dlq.requeued
                )?;
                writeln!(
                    f,
                    "Workers:   active={} queued={} max={}",
                    snapshot.backpressure.active_jobs,
                    snapshot.backpressure.queued_jobs,
                    snapshot.backpressure.max_concurrency
                )?;
                write_circuit(f, &snapshot.circuit)?;
                write_stats(f, &snapshot.stats)
            }
            ResponseData::Campaigns(campaigns) => {
                for summary in campaigns {
                    writeln!(
                        f,
                        "{:<20} {:<8} {}/{} sent, {} failed  {}",
                        summary.campaign.id,
                        summary.campaign.status.to_string(),
                        summary.stats.sent,
                        summary.stats.total,
                        summary.stats.failed,
                        summary.campaign.subject,
                    )?;
                }
                Ok(())
            }
            ResponseData::Circuit(circuit) => write_circuit(f, circuit),
            ResponseData::JobAccepted { job_id } => writeln!(f, "Accepted job {job_id}"),
            ResponseData::Message(message) => writeln!(f, "{message}"),
        }
    }
}

impl Request {
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: None,
            command,
        }
    }

    #[must_use]
    pub fn with_token(command: RequestCommand, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::new(command)
        }
    }

    /// Only an exact version match is accepted
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    const fn current(payload: ResponsePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::current(ResponsePayload::Error(message.into()))
    }

    /// Success with nothing to report
    #[must_use]
    pub const fn ok() -> Self {
        Self::current(ResponsePayload::Ok)
    }

    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self::current(ResponsePayload::Data(Box::new(data)))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn newsletter(command: NewsletterCommand) -> RequestCommand {
        RequestCommand::Newsletter(command)
    }

    #[test]
    fn test_permissions() {
        assert_eq!(RequestCommand::System(SystemCommand::Ping).permission(), Permission::Read);
        assert_eq!(newsletter(NewsletterCommand::QueueMetrics).permission(), Permission::Read);
        assert_eq!(
            newsletter(NewsletterCommand::FailedJobs { limit: 10 }).permission(),
            Permission::Read
        );
        assert_eq!(
            newsletter(NewsletterCommand::ResetCircuitBreaker).permission(),
            Permission::Manage
        );
        assert_eq!(
            newsletter(NewsletterCommand::Publish {
                campaign_id: "c1".to_string()
            })
            .permission(),
            Permission::Publish
        );
    }

    #[test]
    fn test_only_mutating_commands_are_audited() {
        assert!(!newsletter(NewsletterCommand::Stats { campaign_id: None }).is_mutating());
        assert!(!newsletter(NewsletterCommand::Campaigns { limit: 5 }).is_mutating());
        assert!(!RequestCommand::System(SystemCommand::Ping).is_mutating());

        let retry = newsletter(NewsletterCommand::RetryFailedJob {
            job_id: "01J0000000000000000000000".to_string(),
        });
        assert_eq!(retry.audit_action(), Some("newsletter.retry"));
        assert_eq!(retry.audit_target().as_deref(), Some("job:01J0000000000000000000000"));

        let draft = newsletter(NewsletterCommand::GenerateDraft {
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        });
        assert_eq!(draft.audit_action(), Some("newsletter.generate_draft"));
        assert_eq!(draft.audit_target().as_deref(), Some("draft:2026-03-01"));
    }

    #[test]
    fn test_request_survives_bincode() {
        let request = Request::with_token(
            newsletter(NewsletterCommand::GenerateDraft {
                date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            }),
            "secret",
        );

        let bytes = bincode::serde::encode_to_vec(&request, bincode::config::legacy()).unwrap();
        let (decoded, _): (Request, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();

        assert_eq!(decoded.token.as_deref(), Some("secret"));
        assert_eq!(decoded.command, request.command);
        assert!(decoded.is_version_compatible());
    }

    #[test]
    fn test_report_stats() {
        let report = Report(&ResponseData::Stats(DeliveryStats {
            sent: 3,
            failed: 1,
            pending: 0,
            total: 4,
            success_rate: 75.0,
        }))
        .to_string();

        assert!(report.contains("Sent:      3"));
        assert!(report.contains("Success:   75.0%"));
    }
}
