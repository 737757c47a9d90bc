//! Configuration management for the gateway.
//!
//! [`schema`] defines the typed configuration tree; [`loader`] assembles it
//! from an optional JSON file plus `GATEWAY_*` environment overrides.

#![warn(missing_docs, clippy::pedantic)]

pub mod loader;
pub mod schema;

pub use loader::{ConfigError, ConfigLoader, ConfigResult};
pub use schema::{
    AuthConfig, ExecutionMode, GatewayConfig, HealthConfig, PolicyConfig, PoolConfig,
    SandboxConfig, SecretStoreConfig, ServerConfig,
};
