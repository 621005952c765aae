use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifier for a queued job
///
/// A ULID, so identifiers sort lexicographically by creation time and can be
/// generated without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    id: ulid::Ulid,
}

impl JobId {
    /// Create a job ID from a ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new unique job ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Get the underlying ULID
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Get the timestamp (milliseconds since Unix epoch) encoded in this ID
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Operators copy ids out of audit targets such as `job:01J...`
        let s = s.strip_prefix("job:").unwrap_or(s);
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Identity of the worker holding a claim
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Discriminator of a [`JobPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Delivery,
    Publish,
    DraftGeneration,
    Feedback,
}

impl Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delivery => "delivery",
            Self::Publish => "publish",
            Self::DraftGeneration => "draft_generation",
            Self::Feedback => "feedback",
        })
    }
}

/// Work carried by a job, tagged by job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPayload {
    /// Send one campaign to one subscriber
    Delivery {
        campaign_id: String,
        subscriber_id: String,
    },
    /// Fan a campaign out into delivery jobs
    Publish {
        campaign_id: String,
        operator_id: String,
    },
    /// Generate the newsletter draft for a day
    DraftGeneration { date: NaiveDate },
    /// Feed a comment moderation decision back to the content pipeline
    Feedback {
        comment_id: String,
        original_status: String,
        new_status: String,
        admin_id: String,
        reason: Option<String>,
    },
}

impl JobPayload {
    #[must_use]
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::Delivery { .. } => JobType::Delivery,
            Self::Publish { .. } => JobType::Publish,
            Self::DraftGeneration { .. } => JobType::DraftGeneration,
            Self::Feedback { .. } => JobType::Feedback,
        }
    }

    /// Campaign this job belongs to, if any
    #[must_use]
    pub fn campaign_id(&self) -> Option<&str> {
        match self {
            Self::Delivery { campaign_id, .. } | Self::Publish { campaign_id, .. } => {
                Some(campaign_id)
            }
            Self::DraftGeneration { .. } | Self::Feedback { .. } => None,
        }
    }

    /// Recipient of a delivery job
    #[must_use]
    pub fn subscriber_id(&self) -> Option<&str> {
        match self {
            Self::Delivery { subscriber_id, .. } => Some(subscriber_id),
            _ => None,
        }
    }

    /// Dedupe key for a recipient job: one send per campaign and subscriber
    #[must_use]
    pub fn delivery_key(campaign_id: &str, subscriber_id: &str) -> String {
        format!("delivery:{campaign_id}:{subscriber_id}")
    }
}

/// Lifecycle of a job
///
/// `Failed` means the last attempt failed and a retry is scheduled; the job is
/// claimable again once `next_retry_at` has passed. `Sent` and `Dead` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Sent,
    Failed,
    Dead,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Dead => "dead",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub dedupe_key: Option<String>,
    pub status: JobStatus,
    /// Attempts that reached a verdict (sent, failed or dead-lettered).
    /// Released claims do not count.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed. Set for retries and delayed
    /// enqueues alike.
    pub next_retry_at: Option<SystemTime>,
    pub claimed_by: Option<WorkerId>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Job {
    #[must_use]
    pub fn new(payload: JobPayload, options: EnqueueOptions) -> Self {
        let now = SystemTime::now();
        Self {
            id: JobId::generate(),
            payload,
            dedupe_key: options.dedupe_key,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: options.delay.map(|delay| now + delay),
            claimed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a worker may claim this job at `now`
    #[must_use]
    pub fn is_eligible(&self, now: SystemTime) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed)
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    #[must_use]
    pub const fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the job back for this long before it becomes claimable
    pub delay: Option<Duration>,
    /// Enqueueing a second job with the same key returns the first one
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn deduped(key: impl Into<String>) -> Self {
        Self {
            delay: None,
            dedupe_key: Some(key.into()),
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueued {
    pub job_id: JobId,
    /// False when the dedupe key matched an existing job
    pub created: bool,
}

/// A job held by exactly one worker
///
/// Returned by `dequeue`; every follow-up (`ack`, `fail`, `release`,
/// `dead_letter`) must present the claim it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub payload: JobPayload,
    /// Attempts made before this claim
    pub attempts: u32,
    pub worker: WorkerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailOutcome {
    /// Retry scheduled
    Retry {
        next_retry_at: SystemTime,
        attempts: u32,
    },
    /// Attempts exhausted, job moved to the dead letter queue
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub campaign_id: Option<String>,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    #[must_use]
    pub fn campaign(campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: Some(campaign_id.into()),
            job_type: Some(JobType::Delivery),
            status: None,
        }
    }

    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.campaign_id
            .as_deref()
            .is_none_or(|id| job.payload.campaign_id() == Some(id))
            && self.job_type.is_none_or(|ty| job.job_type() == ty)
            && self.status.is_none_or(|status| job.status == status)
    }
}

/// Exact per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub const fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::InProgress => self.in_progress += 1,
            JobStatus::Sent => self.sent += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Dead => self.dead += 1,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.in_progress + self.sent + self.failed + self.dead
    }

    /// Jobs that can still change state
    #[must_use]
    pub const fn non_terminal(&self) -> u64 {
        self.pending + self.in_progress + self.failed
    }
}

/// One entry of the dead letter ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: JobId,
    pub job_type: JobType,
    pub campaign_id: Option<String>,
    pub subscriber_id: Option<String>,
    pub error: String,
    pub attempts: u32,
    pub dead_at: SystemTime,
    /// Set when an operator put the job back into circulation
    pub requeued_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqFilter {
    pub campaign_id: Option<String>,
    pub job_type: Option<JobType>,
    pub include_requeued: bool,
}

impl DlqFilter {
    #[must_use]
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        (self.include_requeued || entry.requeued_at.is_none())
            && self
                .campaign_id
                .as_deref()
                .is_none_or(|id| entry.campaign_id.as_deref() == Some(id))
            && self.job_type.is_none_or(|ty| entry.job_type == ty)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqCounts {
    /// Entries still awaiting operator action
    pub active: u64,
    pub requeued: u64,
}

impl DlqCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.active + self.requeued
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_job_id_parse() {
        let id = JobId::generate();
        assert_eq!(id.to_string().parse::<JobId>().ok(), Some(id));
        assert_eq!(format!("job:{id}").parse::<JobId>().ok(), Some(id));
        assert!("not-a-ulid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_delivery_key() {
        assert_eq!(JobPayload::delivery_key("c1", "s1"), "delivery:c1:s1");
    }

    #[test]
    fn test_delayed_job_not_eligible() {
        let job = Job::new(
            JobPayload::Publish {
                campaign_id: "c1".to_string(),
                operator_id: "op".to_string(),
            },
            EnqueueOptions::default().with_delay(Duration::from_secs(60)),
        );

        assert!(!job.is_eligible(SystemTime::now()));
        assert!(job.is_eligible(SystemTime::now() + Duration::from_secs(61)));
    }

    #[test]
    fn test_terminal_status() {
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_job_filter_matches_campaign() {
        let job = Job::new(
            JobPayload::Delivery {
                campaign_id: "c1".to_string(),
                subscriber_id: "s1".to_string(),
            },
            EnqueueOptions::default(),
        );

        assert!(JobFilter::campaign("c1").matches(&job));
        assert!(!JobFilter::campaign("c2").matches(&job));
        assert!(JobFilter::default().matches(&job));
    }

    #[test]
    fn test_counts_total() {
        let mut counts = JobCounts::default();
        counts.add(JobStatus::Pending);
        counts.add(JobStatus::Failed);
        counts.add(JobStatus::Sent);
        counts.add(JobStatus::Dead);

        assert_eq!(counts.total(), 4);
        assert_eq!(counts.non_terminal(), 2);
    }
}
