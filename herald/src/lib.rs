//! The herald daemon: configuration, wiring and the control handler

pub mod control_handler;
pub mod controller;
