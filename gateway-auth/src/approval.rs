//! Single-use, parameter-bound approval claims.
//!
//! The secret store signs an [`ApprovalClaims`] document when a human approves
//! one sensitive action. The gateway verifies; it never issues.
//!
//! Transport is a [`SignedApproval`]: the claims JSON exactly as signed
//! (base64url) plus an Ed25519 signature over those bytes. Because the
//! signature covers the encoded bytes rather than a re-serialisation, every
//! field reaches the verifier verbatim and any flipped bit is detected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::broker::CredentialBroker;
use crate::clock::{Clock, SystemClock};

/// Claims format version understood by this verifier.
pub const APPROVAL_VERSION: u32 = 1;

/// Reasons an approval is rejected. Every variant is audit-logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// Envelope could not be decoded.
    #[error("malformed approval: {0}")]
    Malformed(String),
    /// Signature does not match the claims.
    #[error("approval signature invalid")]
    BadSignature,
    /// Claims format version is not supported.
    #[error("unsupported approval version {0}")]
    UnsupportedVersion(u32),
    /// Claims were issued by an unexpected authority.
    #[error("approval issuer `{0}` not trusted")]
    WrongIssuer(String),
    /// Claims are addressed to a different audience.
    #[error("approval audience `{0}` does not match")]
    WrongAudience(String),
    /// Claims are past their expiry.
    #[error("approval expired at {expires_at} (now {now})")]
    Expired {
        /// Expiry carried by the claims, in seconds.
        expires_at: u64,
        /// Verifier clock.
        now: u64,
    },
    /// Presented parameters differ from the approved ones.
    #[error("approval parameters do not match")]
    ParamsMismatch,
    /// Token was already presented once.
    #[error("approval token `{0}` already used")]
    Reused(String),
    /// Verification key could not be obtained from the broker.
    #[error("approval public key unavailable: {0}")]
    PublicKeyUnavailable(String),
}

impl ApprovalError {
    /// Short label recorded in audit logs.
    #[must_use]
    pub const fn audit_reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::BadSignature => "bad_signature",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::WrongIssuer(_) => "wrong_issuer",
            Self::WrongAudience(_) => "wrong_audience",
            Self::Expired { .. } => "expired",
            Self::ParamsMismatch => "params_mismatch",
            Self::Reused(_) => "reused",
            Self::PublicKeyUnavailable(_) => "public_key_unavailable",
        }
    }
}

/// Result alias for approval verification.
pub type ApprovalResult<T> = Result<T, ApprovalError>;

/// Authorisation for exactly one sensitive action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalClaims {
    /// Claims format version.
    pub version: u32,
    /// Issuing authority.
    pub issuer: String,
    /// Intended verifier.
    pub audience: String,
    /// Issue time, Unix seconds.
    pub issued_at: u64,
    /// Expiry, Unix seconds.
    pub expires_at: u64,
    /// Single-use token identifier.
    pub token_id: String,
    /// Nonce bound at approval time.
    pub approval_nonce: String,
    /// User who requested the action.
    pub acting_user_id: String,
    /// Provider account the action runs against.
    pub provider_id: String,
    /// External service, e.g. `gmail`.
    pub service: String,
    /// Action name, e.g. `send_message`.
    pub action: String,
    /// User the action targets, if any.
    pub subject_user_id: Option<String>,
    /// Hex SHA-256 of the approved parameters (see [`params_hash`]).
    pub params_hash: String,
}

/// Wire envelope carrying signed claims.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedApproval {
    /// Base64url (no padding) of the claims JSON exactly as signed.
    pub payload: String,
    /// Base64url (no padding) Ed25519 signature over the decoded payload bytes.
    pub signature: String,
}

impl fmt::Debug for SignedApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedApproval")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl SignedApproval {
    /// Signs claims on behalf of the issuing authority.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Malformed`] if the claims cannot be encoded.
    #[cfg(any(test, feature = "issuer"))]
    pub fn issue(
        claims: &ApprovalClaims,
        key: &ed25519_dalek::SigningKey,
    ) -> ApprovalResult<Self> {
        use ed25519_dalek::Signer;

        let bytes =
            serde_json::to_vec(claims).map_err(|err| ApprovalError::Malformed(err.to_string()))?;
        let signature = key.sign(&bytes);
        Ok(Self {
            payload: URL_SAFE_NO_PAD.encode(&bytes),
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }

    /// Checks the signature and decodes the claims without any policy checks.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Malformed`] or [`ApprovalError::BadSignature`].
    pub fn open(&self, key: &VerifyingKey) -> ApprovalResult<ApprovalClaims> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.payload)
            .map_err(|err| ApprovalError::Malformed(format!("payload: {err}")))?;
        let raw_signature = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|_| ApprovalError::BadSignature)?;
        let signature =
            Signature::from_slice(&raw_signature).map_err(|_| ApprovalError::BadSignature)?;
        key.verify(&bytes, &signature)
            .map_err(|_| ApprovalError::BadSignature)?;
        serde_json::from_slice(&bytes).map_err(|err| ApprovalError::Malformed(err.to_string()))
    }
}

/// Hex SHA-256 of the canonical JSON encoding of `params`.
///
/// Object keys are emitted in sorted order, so two semantically equal
/// parameter objects hash identically regardless of construction order.
#[must_use]
pub fn params_hash(params: &Value) -> String {
    let canonical = serde_json::to_vec(params).unwrap_or_default();
    hex::encode(Sha256::digest(canonical))
}

/// Parses a standard base64 Ed25519 public key.
///
/// # Errors
///
/// Returns [`ApprovalError::PublicKeyUnavailable`] for malformed keys.
pub fn parse_verifying_key(encoded: &str) -> ApprovalResult<VerifyingKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim()))
        .map_err(|err| ApprovalError::PublicKeyUnavailable(format!("invalid base64: {err}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ApprovalError::PublicKeyUnavailable("key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|err| ApprovalError::PublicKeyUnavailable(err.to_string()))
}

/// Verifies approvals and remembers consumed token ids.
pub struct ApprovalVerifier {
    issuer: String,
    audience: String,
    consumed: Mutex<HashMap<String, u64>>,
    public_key: OnceCell<VerifyingKey>,
    broker: Option<Arc<dyn CredentialBroker>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ApprovalVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalVerifier")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("consumed", &self.consumed.lock().len())
            .field("public_key_cached", &self.public_key.initialized())
            .finish_non_exhaustive()
    }
}

impl ApprovalVerifier {
    /// Creates a verifier for claims from `issuer` addressed to `audience`.
    #[must_use]
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            consumed: Mutex::new(HashMap::new()),
            public_key: OnceCell::new(),
            broker: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Fetches the verification key from `broker` on first use.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn CredentialBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the cached public key, fetching it from the broker once.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::PublicKeyUnavailable`] when no broker is
    /// configured or the broker call fails. Failures are not cached.
    pub async fn public_key(&self) -> ApprovalResult<VerifyingKey> {
        let key = self
            .public_key
            .get_or_try_init(|| async {
                let broker = self.broker.as_ref().ok_or_else(|| {
                    ApprovalError::PublicKeyUnavailable("no credential broker configured".into())
                })?;
                let encoded = broker
                    .public_key()
                    .await
                    .map_err(|err| ApprovalError::PublicKeyUnavailable(err.to_string()))?;
                let key = parse_verifying_key(&encoded)?;
                info!("approval public key cached");
                Ok::<_, ApprovalError>(key)
            })
            .await?;
        Ok(*key)
    }

    /// Verifies `approval` with the broker-supplied public key.
    ///
    /// # Errors
    ///
    /// See [`ApprovalVerifier::verify`].
    pub async fn verify_presented(
        &self,
        approval: &SignedApproval,
        presented_params: &Value,
    ) -> ApprovalResult<ApprovalClaims> {
        let key = match self.public_key().await {
            Ok(key) => key,
            Err(err) => {
                warn!(reason = err.audit_reason(), error = %err, "approval rejected");
                return Err(err);
            }
        };
        self.verify(approval, &key, presented_params)
    }

    /// Verifies an approval and consumes its token.
    ///
    /// Checks: signature, version, issuer, audience, `now < expiresAt`,
    /// parameter hash, then an atomic check-and-mark of the token id.
    ///
    /// # Errors
    ///
    /// Returns the [`ApprovalError`] for the first failed check.
    pub fn verify(
        &self,
        approval: &SignedApproval,
        public_key: &VerifyingKey,
        presented_params: &Value,
    ) -> ApprovalResult<ApprovalClaims> {
        let claims = match approval.open(public_key) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(reason = err.audit_reason(), error = %err, "approval rejected");
                return Err(err);
            }
        };

        match self.check_claims(&claims, presented_params) {
            Ok(()) => {
                info!(
                    token_id = %claims.token_id,
                    service = %claims.service,
                    action = %claims.action,
                    acting_user_id = %claims.acting_user_id,
                    "approval accepted"
                );
                Ok(claims)
            }
            Err(err) => {
                warn!(
                    token_id = %claims.token_id,
                    service = %claims.service,
                    action = %claims.action,
                    acting_user_id = %claims.acting_user_id,
                    reason = err.audit_reason(),
                    error = %err,
                    "approval rejected"
                );
                Err(err)
            }
        }
    }

    fn check_claims(&self, claims: &ApprovalClaims, presented_params: &Value) -> ApprovalResult<()> {
        if claims.version != APPROVAL_VERSION {
            return Err(ApprovalError::UnsupportedVersion(claims.version));
        }
        if claims.issuer != self.issuer {
            return Err(ApprovalError::WrongIssuer(claims.issuer.clone()));
        }
        if claims.audience != self.audience {
            return Err(ApprovalError::WrongAudience(claims.audience.clone()));
        }

        let now = self.clock.now_secs();
        if now >= claims.expires_at {
            return Err(ApprovalError::Expired {
                expires_at: claims.expires_at,
                now,
            });
        }

        if params_hash(presented_params) != claims.params_hash.to_ascii_lowercase() {
            return Err(ApprovalError::ParamsMismatch);
        }

        let mut consumed = self.consumed.lock();
        consumed.retain(|_, expires_at| *expires_at > now);
        if consumed.contains_key(&claims.token_id) {
            return Err(ApprovalError::Reused(claims.token_id.clone()));
        }
        consumed.insert(claims.token_id.clone(), claims.expires_at);
        Ok(())
    }

    /// Returns the number of consumed tokens that have not yet expired.
    #[must_use]
    pub fn consumed_count(&self) -> usize {
        self.consumed.lock().len()
    }
}
