//! Configuration loader implementations.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use gateway_primitives::ServiceId;
use thiserror::Error;
use tracing::debug;

use crate::schema::{ExecutionMode, GatewayConfig};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for the schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// An environment override carried an unusable value.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The assembled configuration is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Assembles a [`GatewayConfig`] from a JSON file and `GATEWAY_*` variables.
///
/// Variables take precedence over the file. Key material is only ever read
/// from variables.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    vars: HashMap<String, String>,
    file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader over the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_vars(env::vars())
    }

    /// Creates a loader over an explicit set of variables.
    #[must_use]
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        let file = vars.get(CONFIG_PATH_ENV).map(PathBuf::from);
        Self { vars, file }
    }

    /// Overrides the config file path.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Loads, overrides, and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, when a
    /// variable is malformed, or when validation fails.
    pub fn load(&self) -> ConfigResult<GatewayConfig> {
        let mut config = match &self.file {
            Some(path) => read_file(path)?,
            None => GatewayConfig::default(),
        };
        self.apply_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn apply_overrides(&self, config: &mut GatewayConfig) -> ConfigResult<()> {
        if let Some(addr) = self.var("GATEWAY_LISTEN_ADDR") {
            config.server.listen_addr = parse_value("GATEWAY_LISTEN_ADDR", addr)?;
        }

        if let Some(secret) = self.var("GATEWAY_SHARED_SECRET") {
            config.auth.shared_secret = Some(secret.to_owned());
        }
        if let Some(seed) = self.var("GATEWAY_SIGNING_KEY") {
            config.auth.signing_key = Some(seed.to_owned());
        }
        if let Some(key) = self.var("GATEWAY_PRIVILEGED_PUBLIC_KEY") {
            config.auth.privileged_public_key = Some(key.to_owned());
        }
        if let Some(window) = self.var("GATEWAY_FRESHNESS_WINDOW_SECS") {
            config.auth.freshness_window_secs = parse_value("GATEWAY_FRESHNESS_WINDOW_SECS", window)?;
        }

        if let Some(limit) = self.var("GATEWAY_POOL_READ_ONLY") {
            config.pools.read_only = parse_value("GATEWAY_POOL_READ_ONLY", limit)?;
        }
        if let Some(limit) = self.var("GATEWAY_POOL_LOCAL_WRITE") {
            config.pools.local_write = parse_value("GATEWAY_POOL_LOCAL_WRITE", limit)?;
        }

        if let Some(root) = self.var("GATEWAY_WORKSPACE_ROOT") {
            config.policy.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(home) = self.var("HOME") {
            config.policy.home_dir.get_or_insert_with(|| PathBuf::from(home));
        }
        if let Some(roots) = self.var("GATEWAY_SENSITIVE_ROOTS") {
            config.policy.sensitive_roots = env::split_paths(roots).collect();
        }

        if let Some(mode) = self.var("GATEWAY_EXECUTION_MODE") {
            config.sandbox.mode = match mode {
                "native" => ExecutionMode::Native,
                "container" => ExecutionMode::Container,
                other => {
                    return Err(ConfigError::InvalidEnv {
                        var: "GATEWAY_EXECUTION_MODE",
                        reason: format!("expected `native` or `container`, got `{other}`"),
                    });
                }
            };
        }
        if let Some(flag) = self.var("GATEWAY_NETWORK_ISOLATION") {
            config.sandbox.network_isolation = parse_flag("GATEWAY_NETWORK_ISOLATION", flag)?;
        }
        if let Some(flag) = self.var("GATEWAY_ALLOW_UNISOLATED") {
            config.sandbox.allow_unisolated = parse_flag("GATEWAY_ALLOW_UNISOLATED", flag)?;
        }
        if let Some(path) = self.var("GATEWAY_SANDBOX_SENTINEL") {
            config.sandbox.sentinel_path = PathBuf::from(path);
        }

        if let Some(url) = self.var("GATEWAY_SECRET_STORE_URL") {
            config.secret_store.base_url = Some(url.to_owned());
        }
        if let Some(token) = self.var("GATEWAY_SECRET_STORE_TOKEN") {
            config.secret_store.api_token = Some(token.to_owned());
        }

        if let Some(services) = self.var("GATEWAY_HEALTH_SERVICES") {
            config.health.services = services
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ServiceId::new)
                .collect::<Result<_, _>>()
                .map_err(|err| ConfigError::InvalidEnv {
                    var: "GATEWAY_HEALTH_SERVICES",
                    reason: err.to_string(),
                })?;
        }

        Ok(())
    }
}

impl GatewayConfig {
    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated rule.
    pub fn validate(&self) -> ConfigResult<()> {
        if self
            .auth
            .shared_secret
            .as_deref()
            .is_none_or(|secret| secret.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "GATEWAY_SHARED_SECRET must be set".into(),
            ));
        }
        if self.auth.freshness_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "auth.freshness_window_secs must be > 0".into(),
            ));
        }
        if self.auth.nonce_capacity == 0 {
            return Err(ConfigError::Invalid("auth.nonce_capacity must be > 0".into()));
        }
        if self.pools.read_only == 0 || self.pools.local_write == 0 {
            return Err(ConfigError::Invalid("pool limits must be > 0".into()));
        }
        if self.policy.active_skills_dir.trim().is_empty()
            || self.policy.draft_skills_dir.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "policy skill directories cannot be empty".into(),
            ));
        }
        if self.policy.active_skills_dir == self.policy.draft_skills_dir {
            return Err(ConfigError::Invalid(
                "active and draft skill directories must differ".into(),
            ));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> ConfigResult<GatewayConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    debug!(path = %path.display(), "loaded gateway config file");
    Ok(config)
}

fn parse_value<T: std::str::FromStr>(var: &'static str, raw: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        var,
        reason: err.to_string(),
    })
}

fn parse_flag(var: &'static str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidEnv {
            var,
            reason: format!("expected a boolean flag, got `{other}`"),
        }),
    }
}
