//! Observability utilities for the gateway.
//!
//! Two concerns live here: installing the process-wide `tracing` subscriber,
//! and the per-service [`HealthTracker`] that records how external services
//! (token endpoints, third-party APIs) have been behaving.

#![warn(missing_docs, clippy::pedantic)]

pub mod health;
pub mod tracing_support;

pub use health::{HealthRecord, HealthStatus, HealthTracker, FAILURE_THRESHOLD};
pub use tracing_support::{init_tracing, TracingError};
