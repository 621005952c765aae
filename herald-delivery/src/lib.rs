//! Newsletter delivery for herald
//!
//! This crate provides:
//! - Producers that turn campaigns into recipient jobs
//! - A worker pool that drains the job queue into the mail transport
//! - A circuit breaker and backpressure manager guarding that transport
//! - Read-only delivery statistics for operators

pub mod backpressure;
pub mod campaign;
pub mod circuit_breaker;
mod error;
pub mod handlers;
mod processor;
pub mod producer;
pub mod stats;
pub mod transport;

pub use backpressure::{BackpressureConfig, BackpressureManager, BackpressureStatus};
pub use campaign::{
    Audience, Campaign, CampaignStatus, CampaignStore, MemoryCampaignStore, Subscriber,
    SubscriberStatus,
};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use error::{
    CampaignStoreError, DeliveryError, PermanentError, ProducerError, StatsError, SystemError,
    TemporaryError,
};
pub use processor::{DeferCause, DeliveryConfig, DeliveryProcessor, JobOutcome};
pub use producer::{FanOutSummary, FeedbackRequest, Producer, PublishRequest};
pub use stats::{CampaignSummary, DeliveryStats, FailedJob, QueueDepths, QueueSnapshot, StatsAggregator};
pub use transport::{LogTransport, MailTransport, OutboundMessage, TransportError};
