//! Core shared types for the agent execution gateway.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod tier;

/// Error type and result alias shared across the gateway.
pub use error::{Error, Result};
/// Validated identifiers for conversations, pools, and external services.
pub use ids::{ExecutionKey, PoolKey, ServiceId};
/// Trust tiers that select a pool's concurrency budget.
pub use tier::PoolTier;
