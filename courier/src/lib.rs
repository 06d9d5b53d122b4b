//! The courier worker process.
//!
//! [`controller::Controller`] wires configuration, the queue database, the
//! resolver and metrics into a [`worker::Worker`], then runs it until the
//! process is signalled.

pub mod config;
pub mod controller;
pub mod worker;

pub use config::CourierConfig;
pub use controller::Controller;
pub use worker::{ErrorReporter, LogReporter, ShutdownHandle, Worker};
