//! Collaborators for the non-delivery job types
//!
//! Draft generation and comment moderation feedback share the queue with
//! newsletter delivery but have their own business logic, which lives behind
//! these traits.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::DeliveryError;

/// A moderation decision handed to the feedback consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationFeedback {
    pub comment_id: String,
    pub original_status: String,
    pub new_status: String,
    pub admin_id: String,
    pub reason: Option<String>,
}

#[async_trait]
pub trait DraftGenerator: Send + Sync + std::fmt::Debug {
    /// Produce the newsletter draft for `date`
    ///
    /// # Errors
    ///
    /// Permanent errors dead-letter the job; anything else is retried.
    async fn generate(&self, date: NaiveDate) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait FeedbackSink: Send + Sync + std::fmt::Debug {
    /// # Errors
    ///
    /// Permanent errors dead-letter the job; anything else is retried.
    async fn apply(&self, feedback: &ModerationFeedback) -> Result<(), DeliveryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDraftGenerator;

#[async_trait]
impl DraftGenerator for LoggingDraftGenerator {
    async fn generate(&self, date: NaiveDate) -> Result<(), DeliveryError> {
        tracing::info!(%date, "Newsletter draft generation requested");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFeedbackSink;

#[async_trait]
impl FeedbackSink for LoggingFeedbackSink {
    async fn apply(&self, feedback: &ModerationFeedback) -> Result<(), DeliveryError> {
        tracing::info!(
            comment_id = %feedback.comment_id,
            from = %feedback.original_status,
            to = %feedback.new_status,
            admin_id = %feedback.admin_id,
            reason = feedback.reason.as_deref().unwrap_or(""),
            "Moderation feedback recorded"
        );
        Ok(())
    }
}
