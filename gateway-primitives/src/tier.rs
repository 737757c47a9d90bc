//! Pool trust tiers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Trust tier selected by the caller for an execution.
///
/// Each tier carries its own concurrency budget; pools created under a tier
/// inherit that budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTier {
    /// Executions that may only read local state.
    ReadOnly,
    /// Executions allowed to write to the local workspace.
    LocalWrite,
}

impl PoolTier {
    /// All tiers in declaration order.
    pub const ALL: [Self; 2] = [Self::ReadOnly, Self::LocalWrite];

    /// Returns the wire label for the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::LocalWrite => "local_write",
        }
    }
}

impl Display for PoolTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_only" | "read-only" => Ok(Self::ReadOnly),
            "local_write" | "local-write" => Ok(Self::LocalWrite),
            other => Err(Error::UnknownTier(other.to_owned())),
        }
    }
}
