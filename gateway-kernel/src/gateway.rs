//! The gateway service: owns every stateful component and wires the
//! authenticated execution path.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::SigningKey;
use gateway_adapters::{ConversationBackend, ExecutionOptions};
use gateway_auth::{
    ApprovalClaims, ApprovalError, ApprovalVerifier, AuthError, AuthHeaders, AuthKeys, Clock,
    CredentialBroker, HealthReportingBroker, InternalAuthCodec, SignedApproval, SystemClock,
    parse_verifying_key,
};
use gateway_config::{AuthConfig, ConfigError, GatewayConfig};
use gateway_policy::{PolicyChain, PolicyError};
use gateway_primitives::{ExecutionKey, PoolKey, PoolTier, ServiceId};
use gateway_sandbox::SandboxClearance;
use gateway_telemetry::HealthTracker;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::lifecycle::{GatewayState, Lifecycle, LifecycleEvent};
use crate::manager::{ExecutionRequest, ExecutionStream, ManagerError, SessionPoolManager};
use crate::observer::{PolicyObserver, TracingPolicyObserver};
use crate::pool::{PoolError, PoolRegistry};

/// Method of the execution RPC.
pub const EXECUTE_METHOD: &str = "POST";

/// Path of the execution RPC.
pub const EXECUTE_PATH: &str = "/v1/execute";

/// Health-tracker id under which secret-store calls are reported.
pub const SECRET_STORE_SERVICE: &str = "secret-store";

/// Errors produced by the gateway service.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway is not accepting requests.
    #[error("gateway not ready (state: {0:?})")]
    NotReady(GatewayState),
    /// No backend was supplied to the builder.
    #[error("no conversation backend configured")]
    MissingBackend,
    /// The request targets a route the gateway does not serve.
    #[error("unsupported route {method} {path}")]
    UnsupportedRoute {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },
    /// Internal authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Approval verification failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    /// The request body is not a valid execution payload.
    #[error("invalid execution payload: {0}")]
    InvalidPayload(String),
    /// Configured key material could not be decoded.
    #[error("invalid key material for {field}: {reason}")]
    InvalidKey {
        /// Offending configuration field.
        field: &'static str,
        /// Decode failure.
        reason: String,
    },
    /// Session manager rejected the execution.
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// Policy configuration is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Pool configuration is invalid.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A built-in identifier failed validation.
    #[error(transparent)]
    Identifier(#[from] gateway_primitives::Error),
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Body of the execution RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    /// Prompt text.
    pub prompt: String,
    /// Pool tier selector.
    pub tier: PoolTier,
    /// Resource pool the execution runs in.
    pub pool_key: PoolKey,
    /// Conversation the prompt belongs to.
    pub execution_key: ExecutionKey,
    /// Options forwarded to the backend.
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl From<ExecutionPayload> for ExecutionRequest {
    fn from(payload: ExecutionPayload) -> Self {
        ExecutionRequest::new(
            payload.tier,
            payload.pool_key,
            payload.execution_key,
            payload.prompt,
        )
        .with_options(payload.options)
    }
}

/// Collects the collaborators a [`Gateway`] needs.
#[derive(Default)]
pub struct GatewayBuilder {
    backend: Option<Arc<dyn ConversationBackend>>,
    broker: Option<Arc<dyn CredentialBroker>>,
    clock: Option<Arc<dyn Clock>>,
    observer: Option<Arc<dyn PolicyObserver>>,
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("backend", &self.backend.as_ref().map(|backend| backend.name().to_owned()))
            .field("broker", &self.broker.is_some())
            .field("clock", &self.clock.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl GatewayBuilder {
    /// Starts an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the conversational backend. Required.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ConversationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the credential broker used for the approval key.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Overrides the clock used for freshness and expiry checks.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the policy observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PolicyObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validates `config` and assembles a ready gateway.
    ///
    /// Requires a [`SandboxClearance`], so a gateway can only exist once the
    /// sandbox gate has admitted the process.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] when configuration or key material is
    /// invalid, or when no backend was supplied.
    pub fn build(self, config: &GatewayConfig, clearance: SandboxClearance) -> GatewayResult<Gateway> {
        config.validate()?;
        let backend = self.backend.ok_or(GatewayError::MissingBackend)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(TracingPolicyObserver));

        let nonce_capacity = NonZeroUsize::new(config.auth.nonce_capacity).ok_or_else(|| {
            ConfigError::Invalid("auth.nonce_capacity must be > 0".into())
        })?;
        let codec = InternalAuthCodec::with_clock(
            auth_keys(&config.auth)?,
            config.auth.freshness_window_secs,
            nonce_capacity,
            Arc::clone(&clock),
        );

        let secret_store = ServiceId::new(SECRET_STORE_SERVICE)?;
        let health = Arc::new(HealthTracker::new(
            config
                .health
                .services
                .iter()
                .cloned()
                .chain(std::iter::once(secret_store.clone())),
        ));

        let mut approvals = ApprovalVerifier::new(&config.auth.issuer, &config.auth.audience)
            .with_clock(Arc::clone(&clock));
        let broker = self.broker.map(|inner| {
            Arc::new(HealthReportingBroker::new(inner, Arc::clone(&health), secret_store))
                as Arc<dyn CredentialBroker>
        });
        if let Some(broker) = &broker {
            approvals = approvals.with_broker(Arc::clone(broker));
        }

        let manager = SessionPoolManager::with_observer(
            backend,
            PoolRegistry::from_config(&config.pools)?,
            PolicyChain::from_config(&config.policy)?,
            observer,
        );

        let mut lifecycle = Lifecycle::new();
        lifecycle
            .transition(LifecycleEvent::Boot)
            .map_err(|_| GatewayError::NotReady(lifecycle.state()))?;
        info!(
            sandbox = ?clearance.verdict(),
            isolated = clearance.is_isolated(),
            read_only_limit = config.pools.read_only,
            local_write_limit = config.pools.local_write,
            "gateway ready"
        );

        Ok(Gateway {
            lifecycle: Mutex::new(lifecycle),
            clearance,
            codec,
            approvals,
            manager,
            health,
            broker,
        })
    }
}

fn auth_keys(config: &AuthConfig) -> GatewayResult<AuthKeys> {
    let mut keys = AuthKeys::with_shared_secret(
        config.shared_secret.clone().unwrap_or_default().into_bytes(),
    );
    if let Some(seed) = config.signing_key.as_deref() {
        keys = keys.with_signing_key(decode_signing_key(seed)?);
    }
    if let Some(public) = config.privileged_public_key.as_deref() {
        let key = parse_verifying_key(public).map_err(|err| GatewayError::InvalidKey {
            field: "auth.privileged_public_key",
            reason: err.to_string(),
        })?;
        keys = keys.with_verifying_key(key);
    }
    Ok(keys)
}

fn decode_signing_key(seed: &str) -> GatewayResult<SigningKey> {
    let invalid = |reason: String| GatewayError::InvalidKey {
        field: "auth.signing_key",
        reason,
    };
    let bytes = STANDARD
        .decode(seed.trim())
        .map_err(|err| invalid(err.to_string()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| invalid("seed must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// One gateway instance. All caches and session state live here.
pub struct Gateway {
    lifecycle: Mutex<Lifecycle>,
    clearance: SandboxClearance,
    codec: InternalAuthCodec,
    approvals: ApprovalVerifier,
    manager: SessionPoolManager,
    health: Arc<HealthTracker>,
    broker: Option<Arc<dyn CredentialBroker>>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.state())
            .field("clearance", &self.clearance)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> GatewayState {
        self.lifecycle.lock().state()
    }

    /// Returns the clearance the gateway was built with.
    #[must_use]
    pub const fn clearance(&self) -> SandboxClearance {
        self.clearance
    }

    /// Returns the internal auth codec.
    #[must_use]
    pub const fn codec(&self) -> &InternalAuthCodec {
        &self.codec
    }

    /// Returns the session/pool manager.
    #[must_use]
    pub const fn manager(&self) -> &SessionPoolManager {
        &self.manager
    }

    /// Returns the service health tracker.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Returns the health-reporting credential broker, when configured.
    #[must_use]
    pub fn broker(&self) -> Option<&Arc<dyn CredentialBroker>> {
        self.broker.as_ref()
    }

    fn ensure_ready(&self) -> GatewayResult<()> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(GatewayError::NotReady(state))
        }
    }

    /// Authenticates a signed execution RPC and starts the execution.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotReady`] outside the ready state,
    /// [`GatewayError::UnsupportedRoute`] for any other route,
    /// [`GatewayError::Auth`] when the signature, freshness or nonce check
    /// fails, and [`GatewayError::InvalidPayload`] for a malformed body.
    pub fn execute(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &HeaderMap,
    ) -> GatewayResult<ExecutionStream> {
        self.ensure_ready()?;
        if !method.eq_ignore_ascii_case(EXECUTE_METHOD) || path != EXECUTE_PATH {
            return Err(GatewayError::UnsupportedRoute {
                method: method.to_owned(),
                path: path.to_owned(),
            });
        }

        let auth = AuthHeaders::from_header_map(headers).inspect_err(|err| {
            warn!(method, path, reason = %err, "internal request carries no usable auth headers");
        })?;
        self.codec.verify(method, path, body, &auth)?;

        let payload: ExecutionPayload = serde_json::from_slice(body)
            .map_err(|err| GatewayError::InvalidPayload(err.to_string()))?;
        Ok(self.manager.execute(payload.into())?)
    }

    /// Verifies and consumes an approval for the presented parameters.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotReady`] outside the ready state and
    /// [`GatewayError::Approval`] when any approval check fails.
    pub async fn verify_approval(
        &self,
        approval: &SignedApproval,
        presented_params: &Value,
    ) -> GatewayResult<ApprovalClaims> {
        self.ensure_ready()?;
        Ok(self
            .approvals
            .verify_presented(approval, presented_params)
            .await?)
    }

    /// Cancels in-flight executions, drains pools, then clears session records
    /// and remembered nonces. Idempotent.
    pub async fn destroy(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state().is_terminal() {
                return;
            }
            if lifecycle.transition(LifecycleEvent::Drain).is_err() {
                return;
            }
        }
        info!("gateway draining");
        self.manager.destroy().await;
        self.codec.clear_nonces();

        if self.lifecycle.lock().transition(LifecycleEvent::Destroy).is_ok() {
            info!("gateway destroyed");
        }
    }
}
