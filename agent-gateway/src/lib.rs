//! AI-agent execution gateway facade.
//!
//! Bundles the gateway crates behind feature flags so embedders can pull in
//! only the pieces they need, for example just the tool policy engine.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared identifiers for convenience.
pub use gateway_primitives as primitives;

/// Session/pool manager and gateway service (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use gateway_kernel as kernel;

/// Backend contract and secret-store broker (enabled by `adapters` feature).
#[cfg(feature = "adapters")]
pub use gateway_adapters as adapters;

/// Internal auth codec and approval verification (enabled by `auth` feature).
#[cfg(feature = "auth")]
pub use gateway_auth as auth;

/// Tool policy engine (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use gateway_policy as policy;

/// Startup sandbox gate (enabled by `sandbox` feature).
#[cfg(feature = "sandbox")]
pub use gateway_sandbox as sandbox;

/// Tracing setup and service health (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use gateway_telemetry as telemetry;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use gateway_config as config;

/// HTTP transport for the execution RPC (enabled by `server` feature).
#[cfg(feature = "server")]
pub mod server;
