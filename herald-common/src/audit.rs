//! Audit logging for operator actions and delivery lifecycle events
//!
//! Operator actions (retrying a dead job, resetting the circuit breaker,
//! publishing a campaign) are written as [`AuditRecord`]s to an [`AuditSink`].
//! The sink is an external collaborator; [`TracingAuditSink`] emits each record
//! as a structured `tracing` event and [`MemoryAuditSink`] keeps them in memory.
//!
//! ## Lifecycle events
//!
//! - `DeliveryAttempt`: a recipient job is handed to the mail transport
//! - `DeliverySuccess`: the transport accepted the message
//! - `DeliveryFailure`: the job failed (retry scheduled or dead-lettered)
//!
//! ## PII Redaction
//!
//! Recipient addresses are masked before they leave the pipeline, either fully
//! redacted ([`redact_email`]) or partially masked for operator views
//! ([`mask_email`]).

use std::{
    fmt::{self, Display},
    sync::{Arc, OnceLock, PoisonError, RwLock},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Controls the delivery lifecycle events; operator records are always written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Replace the local part of recipient addresses in lifecycle events
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: true,
        }
    }
}

static AUDIT_CONFIG: OnceLock<AuditConfig> = OnceLock::new();

/// Install the process-wide audit settings; later calls are ignored
pub fn init(config: AuditConfig) {
    if AUDIT_CONFIG.set(config).is_err() {
        tracing::debug!("Audit configuration already installed");
    }
}

/// The installed audit settings, or the defaults before [`init`]
#[must_use]
pub fn config() -> AuditConfig {
    AUDIT_CONFIG.get().cloned().unwrap_or_default()
}

/// `local@domain` becomes `[REDACTED]@domain` when `redact` is set
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .split_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

/// Partially mask an email address for operator views
///
/// Keeps the first three characters of the local part when it is longer than
/// three characters, and the full domain: `alice@example.com` becomes
/// `ali***@example.com`. Short or malformed addresses collapse to `***`.
#[must_use]
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return "***".to_string();
    };

    if local.is_empty() || domain.is_empty() {
        return "***".to_string();
    }

    let masked_local = if local.chars().count() > 3 {
        let prefix: String = local.chars().take(3).collect();
        format!("{prefix}***")
    } else {
        "***".to_string()
    };

    format!("{masked_local}@{domain}")
}

/// Result of an audited operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Denied(String),
    Failed(String),
}

impl Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Denied(reason) => write!(f, "denied: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One audited operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Who performed the action (operator id or token name)
    pub actor: String,
    /// Dotted action name, e.g. `newsletter.retry`
    pub action: String,
    /// What the action was applied to, e.g. `job:01J...`
    pub target: Option<String>,
    pub outcome: AuditOutcome,
    pub at: SystemTime,
}

impl AuditRecord {
    #[must_use]
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: Option<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target,
            outcome,
            at: SystemTime::now(),
        }
    }
}

/// Destination for operator audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes audit records as structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let at = chrono::DateTime::<chrono::Utc>::from(record.at).to_rfc3339();
        tracing::event!(
            tracing::Level::INFO,
            event = "OperatorAction",
            actor = %record.actor,
            action = %record.action,
            target = record.target.as_deref().unwrap_or("-"),
            outcome = %record.outcome,
            at = %at,
            "Audit: Operator action"
        );
    }
}

/// Keeps audit records in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records written so far, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Log delivery attempt event
///
/// # Fields
/// - `job_id`: Recipient job identifier (ULID)
/// - `campaign_id`: Campaign the job belongs to
/// - `recipient`: Recipient address (redacted if configured)
/// - `delivery_attempt`: Attempt number (1-based)
pub fn log_delivery_attempt(job_id: &str, campaign_id: &str, recipient: &str, attempt: u32) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliveryAttempt",
        job_id = %job_id,
        campaign_id = %campaign_id,
        recipient = %recipient,
        delivery_attempt = attempt,
        "Audit: Delivery attempt"
    );
}

/// Log delivery success event
pub fn log_delivery_success(job_id: &str, campaign_id: &str, attempt: u32, duration_ms: u128) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliverySuccess",
        job_id = %job_id,
        campaign_id = %campaign_id,
        delivery_attempt = attempt,
        duration_ms = duration_ms,
        "Audit: Delivery successful"
    );
}

/// Log delivery failure event
///
/// `status` is the resulting job status (`failed` for a scheduled retry,
/// `dead` once the job reached the dead letter queue).
pub fn log_delivery_failure(job_id: &str, campaign_id: &str, error: &str, attempt: u32, status: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "DeliveryFailure",
        job_id = %job_id,
        campaign_id = %campaign_id,
        error = %error,
        delivery_attempt = attempt,
        status = %status,
        "Audit: Delivery failed"
    );
}
