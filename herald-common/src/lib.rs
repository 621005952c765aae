//! Shared plumbing for the herald newsletter pipeline
//!
//! - [`logging`]: subscriber setup and the `internal!` family of macros
//! - [`audit`]: operator audit records and PII masking
//! - [`Signal`]: process-wide shutdown signalling

pub mod audit;
pub mod logging;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
