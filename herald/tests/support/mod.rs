//! Test support utilities for E2E testing
//!
//! Starts the delivery pipeline and the control socket in-process so tests
//! can drive herald the way an operator does, through `ControlClient`.

#![allow(dead_code)] // Test utility module - not all methods used in every test

pub mod harness;

pub use harness::{E2ETestHarness, ScriptedTransport};
