//! Queue depth and reliability guard gauges
//!
//! Values are pushed in by whoever computes them (the stats aggregator) and
//! read back by observable gauge callbacks at export time.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::KeyValue;

use crate::MetricsError;

const STATUSES: [&str; 5] = ["pending", "in_progress", "sent", "failed", "dead"];

#[derive(Debug)]
pub struct QueueMetrics {
    /// Job counts indexed like `STATUSES`
    jobs: Arc<[AtomicU64; 5]>,
    dlq_depth: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    /// 0 = closed, 1 = half-open, 2 = open
    circuit_state: Arc<AtomicU64>,
}

impl QueueMetrics {
    /// Create the gauges and register their callbacks
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = opentelemetry::global::meter("herald.queue");

        let jobs = Arc::new([const { AtomicU64::new(0) }; 5]);
        let dlq_depth = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicU64::new(0));
        let circuit_state = Arc::new(AtomicU64::new(0));

        let observed = Arc::clone(&jobs);
        meter
            .u64_observable_gauge("herald.queue.size")
            .with_description("Current number of jobs by status")
            .with_callback(move |observer| {
                for (status, count) in STATUSES.iter().zip(observed.iter()) {
                    observer.observe(
                        count.load(Ordering::Relaxed),
                        &[KeyValue::new("status", *status)],
                    );
                }
            })
            .build();

        let observed = Arc::clone(&dlq_depth);
        meter
            .u64_observable_gauge("herald.queue.dlq.size")
            .with_description("Dead letter entries awaiting operator action")
            .with_callback(move |observer| observer.observe(observed.load(Ordering::Relaxed), &[]))
            .build();

        let observed = Arc::clone(&in_flight);
        meter
            .u64_observable_gauge("herald.delivery.in_flight")
            .with_description("Transport calls currently holding a backpressure slot")
            .with_callback(move |observer| observer.observe(observed.load(Ordering::Relaxed), &[]))
            .build();

        let observed = Arc::clone(&circuit_state);
        meter
            .u64_observable_gauge("herald.delivery.circuit.state")
            .with_description("Circuit breaker state (0 closed, 1 half-open, 2 open)")
            .with_callback(move |observer| observer.observe(observed.load(Ordering::Relaxed), &[]))
            .build();

        Ok(Self {
            jobs,
            dlq_depth,
            in_flight,
            circuit_state,
        })
    }

    /// Set absolute job counts, in `pending, in_progress, sent, failed, dead` order
    pub fn set_job_counts(&self, counts: [u64; 5]) {
        for (slot, value) in self.jobs.iter().zip(counts) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Get the current count for a status
    #[must_use]
    pub fn job_count(&self, status: &str) -> u64 {
        STATUSES
            .iter()
            .position(|s| *s == status)
            .map_or(0, |index| self.jobs[index].load(Ordering::Relaxed))
    }

    pub fn set_dlq_depth(&self, depth: u64) {
        self.dlq_depth.store(depth, Ordering::Relaxed);
    }

    #[must_use]
    pub fn dlq_depth(&self) -> u64 {
        self.dlq_depth.load(Ordering::Relaxed)
    }

    pub fn set_in_flight(&self, in_flight: u64) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }

    pub fn set_circuit_state(&self, state: u64) {
        self.circuit_state.store(state, Ordering::Relaxed);
    }

    #[must_use]
    pub fn circuit_state(&self) -> u64 {
        self.circuit_state.load(Ordering::Relaxed)
    }
}
