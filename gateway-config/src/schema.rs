//! Strongly typed configuration schemas.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use gateway_primitives::{PoolTier, ServiceId};
use serde::{Deserialize, Serialize};

/// Default freshness window for signed internal requests.
pub const DEFAULT_FRESHNESS_WINDOW_SECS: u64 = 300;
/// Default number of nonces remembered for replay protection.
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;
/// Default port of the execution RPC listener.
pub const DEFAULT_LISTEN_PORT: u16 = 8787;
/// Default well-known location of the network-isolation sentinel.
pub const DEFAULT_SENTINEL_PATH: &str = "/run/agent-gateway/network-isolation.ready";

/// Root configuration for the gateway process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Execution RPC listener.
    pub server: ServerConfig,
    /// Internal RPC authentication and approval verification.
    pub auth: AuthConfig,
    /// Concurrency budgets per pool tier.
    pub pools: PoolConfig,
    /// Tool policy roots.
    pub policy: PolicyConfig,
    /// Startup sandbox gate.
    pub sandbox: SandboxConfig,
    /// Remote secret store used by the credential broker.
    pub secret_store: SecretStoreConfig,
    /// External services tracked by the health tracker.
    pub health: HealthConfig,
}

/// Internal authentication settings.
///
/// Key material is never read from the config file; the loader only fills it
/// from the environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Audience that approval claims must be addressed to.
    pub audience: String,
    /// Issuer that approval claims must come from.
    pub issuer: String,
    /// Maximum accepted clock distance for signed requests, in seconds.
    pub freshness_window_secs: u64,
    /// Upper bound on remembered nonces.
    pub nonce_capacity: usize,
    /// Shared secret for HMAC-signed internal scopes.
    #[serde(skip)]
    pub shared_secret: Option<String>,
    /// Base64 Ed25519 seed used to sign privileged-scope requests.
    #[serde(skip)]
    pub signing_key: Option<String>,
    /// Base64 Ed25519 public key accepted for privileged-scope requests.
    pub privileged_public_key: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("freshness_window_secs", &self.freshness_window_secs)
            .field("nonce_capacity", &self.nonce_capacity)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .field("privileged_public_key", &self.privileged_public_key)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            audience: "agent-gateway".to_owned(),
            issuer: "secret-store".to_owned(),
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW_SECS,
            nonce_capacity: DEFAULT_NONCE_CAPACITY,
            shared_secret: None,
            signing_key: None,
            privileged_public_key: None,
        }
    }
}

/// Concurrency limits per tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Limit applied to each read-only pool.
    pub read_only: usize,
    /// Limit applied to each local-write pool.
    pub local_write: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            read_only: 4,
            local_write: 1,
        }
    }
}

impl PoolConfig {
    /// Returns the concurrency limit for a tier.
    #[must_use]
    pub const fn limit(&self, tier: PoolTier) -> usize {
        match tier {
            PoolTier::ReadOnly => self.read_only,
            PoolTier::LocalWrite => self.local_write,
        }
    }
}

/// Directory roots the tool policy engine guards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Root that relative tool paths are resolved against.
    pub workspace_root: Option<PathBuf>,
    /// Home directory used to expand `~` in shell commands and paths.
    pub home_dir: Option<PathBuf>,
    /// Segment sequence of the live skills directory (writes denied).
    pub active_skills_dir: String,
    /// Segment sequence of the draft skills directory (writes allowed).
    pub draft_skills_dir: String,
    /// Roots no tool may touch, for example a credentials directory.
    pub sensitive_roots: Vec<PathBuf>,
    /// Also classify the symlink-resolved form of each path.
    pub resolve_symlinks: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            home_dir: None,
            active_skills_dir: ".claude/skills".to_owned(),
            draft_skills_dir: ".claude/skills-draft".to_owned(),
            sensitive_roots: Vec::new(),
            resolve_symlinks: true,
        }
    }
}

/// How tools are executed relative to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Tools run directly on the host; no isolation gate applies.
    #[default]
    Native,
    /// Tools run inside a container whose network isolation must be verified.
    Container,
}

/// Startup sandbox gate settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Execution mode of this process.
    pub mode: ExecutionMode,
    /// Operator requested network isolation.
    pub network_isolation: bool,
    /// Operator explicitly accepts running without isolation.
    pub allow_unisolated: bool,
    /// Marker file written by the privileged isolation setup step.
    pub sentinel_path: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Native,
            network_isolation: false,
            allow_unisolated: false,
            sentinel_path: PathBuf::from(DEFAULT_SENTINEL_PATH),
        }
    }
}

/// Remote secret store endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretStoreConfig {
    /// Base URL, e.g. `https://secrets.internal/`.
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Bearer token presented to the secret store.
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 10,
            api_token: None,
        }
    }
}

impl fmt::Debug for SecretStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStoreConfig")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Execution RPC listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the daemon binds. Port `0` picks a free port.
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
        }
    }
}

/// External services whose health is tracked from startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Service identifiers.
    pub services: Vec<ServiceId>,
}
