//! Scripted mail transport for delivery tests
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! The transport can:
//! - Fail every call while marked unhealthy
//! - Fail specific recipients a fixed number of times, or forever
//! - Delay each call to exercise concurrency limits and timeouts
//! - Report call counts and the peak number of concurrent calls
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_transport::MockTransport;
//! use herald_delivery::TransportError;
//!
//! let transport = MockTransport::builder()
//!     .fail_recipient("b@example.com", [TransportError::Busy("421".into())])
//!     .build();
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_delivery::{MailTransport, OutboundMessage, TransportError};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    delay: Option<Duration>,
    failing: Option<TransportError>,
    scripted: HashMap<String, VecDeque<TransportError>>,
    always: HashMap<String, TransportError>,
}

impl MockTransportBuilder {
    /// Sleep this long inside every call
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every call with `error` until [`MockTransport::heal`]
    #[must_use]
    pub fn failing_with(mut self, error: TransportError) -> Self {
        self.failing = Some(error);
        self
    }

    /// Fail calls for `to` with these errors, in order, then succeed
    #[must_use]
    pub fn fail_recipient(
        mut self,
        to: &str,
        errors: impl IntoIterator<Item = TransportError>,
    ) -> Self {
        self.scripted
            .entry(to.to_string())
            .or_default()
            .extend(errors);
        self
    }

    /// Fail every call for `to`
    #[must_use]
    pub fn always_fail(mut self, to: &str, error: TransportError) -> Self {
        self.always.insert(to.to_string(), error);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            delay: self.delay,
            failing: Mutex::new(self.failing),
            scripted: Mutex::new(self.scripted),
            always: self.always,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }
}

#[derive(Debug)]
pub struct MockTransport {
    delay: Option<Duration>,
    failing: Mutex<Option<TransportError>>,
    scripted: Mutex<HashMap<String, VecDeque<TransportError>>>,
    always: HashMap<String, TransportError>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delivered: Mutex<Vec<OutboundMessage>>,
}

impl MockTransport {
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// A transport that accepts everything immediately
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    /// Stop failing every call
    pub fn heal(&self) {
        *self.failing.lock() = None;
    }

    /// Start failing every call
    pub fn break_with(&self, error: TransportError) {
        *self.failing.lock() = Some(error);
    }

    /// Total calls, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Messages accepted so far
    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().clone()
    }

    /// How many times `to` was accepted
    pub fn delivered_to(&self, to: &str) -> usize {
        self.delivered.lock().iter().filter(|m| m.to == to).count()
    }

    fn verdict(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if let Some(error) = self.failing.lock().clone() {
            return Err(error);
        }

        if let Some(error) = self.always.get(&message.to) {
            return Err(error.clone());
        }

        if let Some(error) = self
            .scripted
            .lock()
            .get_mut(&message.to)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        self.delivered.lock().push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.verdict(message);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
