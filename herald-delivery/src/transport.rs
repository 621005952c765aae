//! Mail transport seam
//!
//! The SMTP or API provider lives outside the pipeline. Workers only see the
//! [`MailTransport`] trait and a classified [`TransportError`].

use async_trait::async_trait;
use herald_queue::JobId;
use thiserror::Error;

/// A fully addressed message for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub job_id: JobId,
    pub campaign_id: String,
    pub subscriber_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("hard bounce: {0}")]
    HardBounce(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error: {0}")]
    Server(String),
}

impl TransportError {
    /// Whether retrying can never succeed
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::HardBounce(_) | Self::Rejected(_) | Self::InvalidRecipient(_)
        )
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Hand one message to the provider
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing why the provider did not accept
    /// the message.
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Dry-run transport that only logs what it would send
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        tracing::info!(
            job_id = %message.job_id,
            campaign_id = %message.campaign_id,
            subject = %message.subject,
            "Dry-run transport accepted message"
        );
        Ok(())
    }
}
