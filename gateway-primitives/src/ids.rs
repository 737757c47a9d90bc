//! Identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_KEY_LEN: usize = 256;
const MAX_SERVICE_LEN: usize = 64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $validate:path) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier after validating its format.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidIdentifier`] when the value is rejected.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                $validate($kind, &value)?;
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Caller-supplied key identifying one logical conversation (for example one chat).
    ExecutionKey,
    "execution key",
    validate_key
);

string_id!(
    /// Key identifying a concurrency-bounded resource pool.
    PoolKey,
    "pool key",
    validate_key
);

string_id!(
    /// Identifier of a tracked external service (for example `gmail`).
    ServiceId,
    "service id",
    validate_service
);

fn invalid(kind: &'static str, value: &str, reason: impl Into<String>) -> Error {
    Error::InvalidIdentifier {
        kind,
        value: value.into(),
        reason: reason.into(),
    }
}

fn validate_key(kind: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(kind, value, "value cannot be empty"));
    }
    if value.len() > MAX_KEY_LEN {
        return Err(invalid(
            kind,
            value,
            format!("length must be <= {MAX_KEY_LEN}"),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(kind, value, "control characters are not allowed"));
    }
    Ok(())
}

fn validate_service(kind: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(kind, value, "value cannot be empty"));
    }
    if value.len() > MAX_SERVICE_LEN {
        return Err(invalid(
            kind,
            value,
            format!("length must be <= {MAX_SERVICE_LEN}"),
        ));
    }
    if !value
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(invalid(
            kind,
            value,
            "must contain lowercase alphanumeric, dash, underscore, or dot",
        ));
    }
    Ok(())
}
