//! Structured tracing helpers.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter directive used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Errors produced while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    /// The supplied filter directive could not be parsed.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter {
        /// Directive that failed to parse.
        directive: String,
        /// Parser error message.
        reason: String,
    },
    /// A global subscriber was already installed.
    #[error("tracing subscriber already installed")]
    AlreadyInstalled,
}

/// Installs the process-wide fmt subscriber.
///
/// The filter comes from `RUST_LOG` when present, otherwise from `fallback`
/// (or [`DEFAULT_FILTER`] when `fallback` is `None`).
///
/// # Errors
///
/// Returns [`TracingError::InvalidFilter`] for an unparsable fallback, and
/// [`TracingError::AlreadyInstalled`] when called twice in one process.
pub fn init_tracing(fallback: Option<&str>) -> Result<(), TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = fallback.unwrap_or(DEFAULT_FILTER);
            EnvFilter::try_new(directive).map_err(|err| TracingError::InvalidFilter {
                directive: directive.to_owned(),
                reason: err.to_string(),
            })?
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|_| TracingError::AlreadyInstalled)
}

