//! Test support for delivery pipeline tests
//!
//! A scripted mail transport, a job store with enqueue latency, and a harness
//! that wires the queue, content store, processor and stats aggregator
//! together in memory.

pub mod harness;
pub mod mock_transport;
pub mod slow_store;

pub use harness::Pipeline;
pub use mock_transport::MockTransport;
