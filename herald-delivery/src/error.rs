//! Failure taxonomy for the worker, producers and stats
//!
//! A [`DeliveryError`] decides what happens to a job: permanent failures go
//! straight to the dead letter queue, temporary ones are retried with backoff
//! and count against the circuit breaker, system errors are retried without
//! blaming the transport.

use herald_queue::QueueError;
use thiserror::Error;

use crate::{campaign::CampaignStatus, transport::TransportError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("permanent: {0}")]
    Permanent(#[from] PermanentError),

    #[error("temporary: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("internal: {0}")]
    System(#[from] SystemError),
}

/// Retrying cannot help
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is missing or malformed.
    #[error("invalid recipient {0}")]
    InvalidRecipient(String),

    /// The transport reported a hard bounce.
    #[error("hard bounce: {0}")]
    HardBounce(String),

    /// Message was rejected by the transport (policy violation, spam).
    #[error("message rejected: {0}")]
    MessageRejected(String),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    /// Subscriber opted out after the job was enqueued.
    #[error("Subscriber unsubscribed: {0}")]
    Unsubscribed(String),

    /// The job can never be processed as queued.
    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// The transport may accept the same message later
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to reach the mail transport.
    #[error("transport unreachable: {0}")]
    ConnectionFailed(String),

    /// Transport is temporarily busy or unavailable.
    #[error("transport busy: {0}")]
    ServerBusy(String),

    /// Rate limit exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport call exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Transport returned a server-side error.
    #[error("transport error: {0}")]
    ServerError(String),
}

/// Our own plumbing failed
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The content store could not be read or written.
    #[error("Content store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether the worker pool has to stop
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::System(SystemError::Queue(e)) if e.is_fatal())
    }
}

impl From<QueueError> for DeliveryError {
    fn from(error: QueueError) -> Self {
        Self::System(SystemError::Queue(error))
    }
}

/// Convert a transport error into the delivery taxonomy.
///
/// Hard bounces and rejections are permanent; everything else the transport
/// reports is treated as transient.
impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::HardBounce(msg) => Self::Permanent(PermanentError::HardBounce(msg)),
            TransportError::Rejected(msg) => Self::Permanent(PermanentError::MessageRejected(msg)),
            TransportError::InvalidRecipient(msg) => {
                Self::Permanent(PermanentError::InvalidRecipient(msg))
            }
            TransportError::Connection(msg) => {
                Self::Temporary(TemporaryError::ConnectionFailed(msg))
            }
            TransportError::Busy(msg) => Self::Temporary(TemporaryError::ServerBusy(msg)),
            TransportError::RateLimited(msg) => Self::Temporary(TemporaryError::RateLimited(msg)),
            TransportError::Server(msg) => Self::Temporary(TemporaryError::ServerError(msg)),
        }
    }
}

/// Errors from the content store collaborator.
#[derive(Debug, Error)]
pub enum CampaignStoreError {
    #[error("Campaign not found: {0}")]
    NotFound(String),

    /// Compare-and-set on the campaign status lost.
    #[error("Campaign {campaign_id} is {actual}, expected {expected}")]
    InvalidTransition {
        campaign_id: String,
        expected: CampaignStatus,
        actual: CampaignStatus,
    },

    #[error("Content store error: {0}")]
    Storage(String),
}

/// Errors returned synchronously by the producers.
///
/// Validation failures never reach the queue.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Campaign {campaign_id} is already {status}")]
    InvalidState {
        campaign_id: String,
        status: CampaignStatus,
    },

    #[error("Campaign {0} is paused")]
    Paused(String),

    #[error("Campaign {0} has no eligible subscribers")]
    NoEligibleSubscribers(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Content store error: {0}")]
    Store(String),
}

impl From<CampaignStoreError> for ProducerError {
    fn from(error: CampaignStoreError) -> Self {
        match error {
            CampaignStoreError::NotFound(id) => Self::CampaignNotFound(id),
            CampaignStoreError::InvalidTransition {
                campaign_id,
                actual,
                ..
            } => Self::InvalidState {
                campaign_id,
                status: actual,
            },
            CampaignStoreError::Storage(msg) => Self::Store(msg),
        }
    }
}

/// Errors from the stats aggregator.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Content store error: {0}")]
    Store(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),
}

impl From<CampaignStoreError> for StatsError {
    fn from(error: CampaignStoreError) -> Self {
        match error {
            CampaignStoreError::NotFound(id) => Self::CampaignNotFound(id),
            other => Self::Store(other.to_string()),
        }
    }
}
