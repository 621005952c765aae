//! Delivery worker metrics
//!
//! Tracks job processing including:
//! - Attempts by job type and outcome
//! - Mail transport call durations
//! - Retries and dead-lettered jobs
//! - Jobs deferred by the circuit breaker or backpressure

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Why a claimed job was handed back without an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    CircuitOpen,
    Backpressure,
}

impl DeferReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Backpressure => "backpressure",
        }
    }
}

/// Delivery metrics collector
#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Attempts by job type and outcome
    attempts_total: Counter<u64>,

    /// Distribution of mail transport call durations
    duration_seconds: Histogram<f64>,

    /// Jobs scheduled for another attempt
    jobs_retried: Counter<u64>,

    /// Jobs moved to the dead letter queue
    jobs_dead_lettered: Counter<u64>,

    /// Jobs released without an attempt, by reason
    jobs_deferred: Counter<u64>,

    /// Circuit breaker state changes, by new state
    breaker_transitions: Counter<u64>,

    // Local mirrors for the operator CLI and tests
    sent_count: AtomicU64,
    retried_count: AtomicU64,
    dead_count: AtomicU64,
    breaker_rejections: AtomicU64,
    backpressure_rejections: AtomicU64,
}

impl DeliveryMetrics {
    /// Create a new delivery metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let attempts_total = meter
            .u64_counter("herald.delivery.attempts.total")
            .with_description("Total number of job attempts by type and outcome")
            .build();

        let duration_seconds = meter
            .f64_histogram("herald.delivery.transport.duration.seconds")
            .with_description("Distribution of mail transport call durations")
            .build();

        let jobs_retried = meter
            .u64_counter("herald.delivery.jobs.retried.total")
            .with_description("Total number of jobs scheduled for retry")
            .build();

        let jobs_dead_lettered = meter
            .u64_counter("herald.delivery.jobs.dead_lettered.total")
            .with_description("Total number of jobs moved to the dead letter queue")
            .build();

        let jobs_deferred = meter
            .u64_counter("herald.delivery.jobs.deferred.total")
            .with_description("Total number of jobs released without an attempt")
            .build();

        let breaker_transitions = meter
            .u64_counter("herald.delivery.circuit.transitions.total")
            .with_description("Circuit breaker state transitions by new state")
            .build();

        Ok(Self {
            attempts_total,
            duration_seconds,
            jobs_retried,
            jobs_dead_lettered,
            jobs_deferred,
            breaker_transitions,
            sent_count: AtomicU64::new(0),
            retried_count: AtomicU64::new(0),
            dead_count: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
        })
    }

    /// Record a finished attempt
    pub fn record_attempt(&self, job_type: &str, outcome: &str) {
        let attributes = [
            KeyValue::new("job_type", job_type.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.attempts_total.add(1, &attributes);
    }

    /// Record a successful send
    pub fn record_sent(&self, job_type: &str, duration_secs: f64) {
        self.duration_seconds
            .record(duration_secs, &[KeyValue::new("outcome", "sent")]);
        self.sent_count.fetch_add(1, Ordering::Relaxed);
        self.record_attempt(job_type, "sent");
    }

    /// Record a failed attempt that will be retried
    pub fn record_retry(&self, job_type: &str) {
        self.jobs_retried.add(1, &[]);
        self.retried_count.fetch_add(1, Ordering::Relaxed);
        self.record_attempt(job_type, "retry");
    }

    /// Record a job moved to the dead letter queue
    pub fn record_dead_letter(&self, job_type: &str, reason: &str) {
        self.jobs_dead_lettered
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
        self.dead_count.fetch_add(1, Ordering::Relaxed);
        self.record_attempt(job_type, "dead");
    }

    /// Record the duration of a failed transport call
    pub fn record_transport_failure(&self, duration_secs: f64) {
        self.duration_seconds
            .record(duration_secs, &[KeyValue::new("outcome", "failed")]);
    }

    /// Record a job released without an attempt
    pub fn record_deferred(&self, reason: DeferReason) {
        self.jobs_deferred
            .add(1, &[KeyValue::new("reason", reason.as_str())]);

        let counter = match reason {
            DeferReason::CircuitOpen => &self.breaker_rejections,
            DeferReason::Backpressure => &self.backpressure_rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a circuit breaker state change
    pub fn record_breaker_transition(&self, state: &str) {
        self.breaker_transitions
            .add(1, &[KeyValue::new("state", state.to_string())]);
    }

    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retried_count(&self) -> u64 {
        self.retried_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dead_count(&self) -> u64 {
        self.dead_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deferred_count(&self, reason: DeferReason) -> u64 {
        match reason {
            DeferReason::CircuitOpen => self.breaker_rejections.load(Ordering::Relaxed),
            DeferReason::Backpressure => self.backpressure_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Get the OpenTelemetry meter for delivery metrics
fn meter() -> Meter {
    opentelemetry::global::meter("herald.delivery")
}
