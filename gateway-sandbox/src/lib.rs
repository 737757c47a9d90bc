//! Startup sandbox gate.
//!
//! Runs once, synchronously, before anything that can execute a tool is
//! constructed. In container mode the gate refuses to start unless network
//! isolation is proven by a sentinel file, or the operator explicitly accepts
//! running without isolation. A refusal is fatal and is never recovered
//! in-process.

#![warn(missing_docs, clippy::pedantic)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use gateway_config::{ExecutionMode, SandboxConfig};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

/// Process exit status used when the gate refuses to start (`EX_CONFIG`).
pub const REFUSAL_EXIT_CODE: i32 = 78;

/// Outcome of a successful gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxVerdict {
    /// Tools run on the host; no isolation is expected.
    Native,
    /// Container without isolation, accepted by explicit operator override.
    ContainerUnverified,
    /// Container with isolation confirmed by the sentinel.
    ContainerVerified,
}

/// Reasons the gate refuses to start.
#[derive(Debug, Error)]
pub enum SandboxRefusal {
    /// Container mode without isolation and without the override.
    #[error(
        "container mode requires network isolation; enable it or set GATEWAY_ALLOW_UNISOLATED=true to accept running without it"
    )]
    IsolationNotEnabled,
    /// Isolation was requested but its setup never completed.
    #[error("network isolation requested but sentinel {path} is missing")]
    SentinelMissing {
        /// Expected sentinel location.
        path: PathBuf,
    },
    /// The sentinel exists but is not a regular file.
    #[error("network isolation sentinel {path} is not a regular file")]
    SentinelNotFile {
        /// Sentinel location.
        path: PathBuf,
    },
    /// The sentinel could not be inspected.
    #[error("cannot inspect network isolation sentinel {path}: {source}")]
    SentinelUnreadable {
        /// Sentinel location.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Proof that the sandbox gate admitted this process.
///
/// Only [`SandboxGate::evaluate`] can produce one, so anything that demands a
/// clearance cannot be constructed before the gate has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxClearance {
    verdict: SandboxVerdict,
}

impl SandboxClearance {
    /// Returns the verdict that granted the clearance.
    #[must_use]
    pub const fn verdict(self) -> SandboxVerdict {
        self.verdict
    }

    /// Returns true when tools are known to run without network access.
    #[must_use]
    pub const fn is_isolated(self) -> bool {
        matches!(self.verdict, SandboxVerdict::ContainerVerified)
    }
}

/// Evaluates sandbox configuration against the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct SandboxGate<'a> {
    config: &'a SandboxConfig,
}

impl<'a> SandboxGate<'a> {
    /// Creates a gate over `config`.
    #[must_use]
    pub const fn new(config: &'a SandboxConfig) -> Self {
        Self { config }
    }

    /// Decides whether the process may start.
    ///
    /// An absent sentinel is a refusal even when the override is set: the
    /// override only covers the case where isolation was never requested.
    ///
    /// # Errors
    ///
    /// Returns the [`SandboxRefusal`] describing why the process must stop.
    pub fn evaluate(&self) -> Result<SandboxClearance, SandboxRefusal> {
        let verdict = match self.config.mode {
            ExecutionMode::Native => SandboxVerdict::Native,
            ExecutionMode::Container if self.config.network_isolation => {
                check_sentinel(&self.config.sentinel_path)?;
                SandboxVerdict::ContainerVerified
            }
            ExecutionMode::Container if self.config.allow_unisolated => {
                SandboxVerdict::ContainerUnverified
            }
            ExecutionMode::Container => return Err(SandboxRefusal::IsolationNotEnabled),
        };

        match verdict {
            SandboxVerdict::Native => info!("sandbox gate: native execution"),
            SandboxVerdict::ContainerVerified => info!(
                sentinel = %self.config.sentinel_path.display(),
                "sandbox gate: network isolation verified"
            ),
            SandboxVerdict::ContainerUnverified => warn!(
                "!!! sandbox gate: container running WITHOUT network isolation; tools can reach the network (operator override) !!!"
            ),
        }
        Ok(SandboxClearance { verdict })
    }

    /// Evaluates the gate and terminates the process on refusal.
    #[must_use]
    pub fn enforce(&self) -> SandboxClearance {
        match self.evaluate() {
            Ok(clearance) => clearance,
            Err(refusal) => {
                error!(reason = %refusal, exit_code = REFUSAL_EXIT_CODE, "sandbox gate refused startup");
                eprintln!("agent-gateway: refusing to start: {refusal}");
                std::process::exit(REFUSAL_EXIT_CODE);
            }
        }
    }
}

fn check_sentinel(path: &Path) -> Result<(), SandboxRefusal> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => Err(SandboxRefusal::SentinelNotFile {
            path: path.to_owned(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SandboxRefusal::SentinelMissing {
            path: path.to_owned(),
        }),
        Err(source) => Err(SandboxRefusal::SentinelUnreadable {
            path: path.to_owned(),
            source,
        }),
    }
}
