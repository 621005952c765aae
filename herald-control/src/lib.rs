//! Control protocol for operating a running herald instance
//!
//! This crate provides an IPC mechanism using Unix domain sockets to:
//! - Read delivery statistics, failed jobs and queue metrics
//! - Requeue dead jobs and reset the circuit breaker
//! - Publish campaigns and request drafts
//!
//! Requests carry a bearer token checked by an [`Authorizer`]. The protocol
//! uses bincode for serialization.

pub mod auth;
pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;

pub use auth::{
    AuthError, Authorizer, ControlAuthConfig, Permission, Principal, TokenAuthorizer, TokenGrant,
    hash_token,
};
pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    NewsletterCommand, PROTOCOL_VERSION, Report, Request, RequestCommand, Response, ResponseData,
    ResponsePayload, SystemCommand,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/herald.sock";
