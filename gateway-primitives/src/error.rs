//! Shared error definitions for gateway primitives.

use thiserror::Error;

/// Result alias used throughout the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing gateway primitive types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Identifier failed validation.
    #[error("invalid {kind} `{value}`: {reason}")]
    InvalidIdentifier {
        /// Which identifier type rejected the value.
        kind: &'static str,
        /// The offending value.
        value: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Pool tier selector was not recognised.
    #[error("unknown pool tier `{0}`")]
    UnknownTier(String),
}
