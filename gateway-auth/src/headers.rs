//! Signed headers for internal RPC calls.
//!
//! The canonical string is
//!
//! ```text
//! METHOD \n PATH \n hex(sha256(body)) \n TIMESTAMP \n NONCE
//! ```
//!
//! The body enters as a digest so the separator can never appear inside a
//! field; method, path and nonce are validated to exclude it.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::nonce::NonceCache;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the auth scope.
pub const SCOPE_HEADER: HeaderName = HeaderName::from_static("x-gateway-scope");
/// Header carrying the Unix timestamp in seconds.
pub const TIMESTAMP_HEADER: HeaderName = HeaderName::from_static("x-gateway-timestamp");
/// Header carrying the per-request nonce.
pub const NONCE_HEADER: HeaderName = HeaderName::from_static("x-gateway-nonce");
/// Header carrying the base64 signature.
pub const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-gateway-signature");

const MIN_NONCE_LEN: usize = 16;
const MAX_NONCE_LEN: usize = 128;

/// Errors raised while building or verifying internal auth headers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A required header was absent.
    #[error("missing auth header `{0}`")]
    MissingHeader(&'static str),
    /// A header or request field was malformed.
    #[error("malformed auth input: {0}")]
    Malformed(String),
    /// The scope is unknown or has no key configured on this side.
    #[error("scope `{0}` is not configured")]
    ScopeNotConfigured(AuthScope),
    /// The timestamp is outside the freshness window.
    #[error("request timestamp {timestamp} outside freshness window (now {now})")]
    StaleTimestamp {
        /// Timestamp carried by the request.
        timestamp: u64,
        /// Verifier clock at the time of the check.
        now: u64,
    },
    /// The nonce was already used inside the freshness window.
    #[error("nonce already used")]
    ReplayedNonce,
    /// The replay cache is full of live nonces.
    #[error("replay cache saturated")]
    ReplayCacheFull,
    /// Signature did not verify.
    #[error("signature mismatch")]
    BadSignature,
}

/// Result alias for internal auth operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Selects the signing scheme for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    /// Shared-secret HMAC-SHA256; any holder of the secret can sign.
    Internal,
    /// Ed25519; only the holder of the private key can sign.
    Privileged,
}

impl AuthScope {
    /// Returns the header label for the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Privileged => "privileged",
        }
    }
}

impl fmt::Display for AuthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthScope {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "privileged" => Ok(Self::Privileged),
            other => Err(AuthError::Malformed(format!("unknown scope `{other}`"))),
        }
    }
}

/// Header set attached to every signed internal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// Signing scope.
    pub scope: AuthScope,
    /// Unix seconds at signing time.
    pub timestamp: u64,
    /// Random single-use value.
    pub nonce: String,
    /// Base64 (no padding) signature over the canonical string.
    pub signature: String,
}

impl AuthHeaders {
    /// Writes the header set into an HTTP header map.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Malformed`] if a value is not a valid header value.
    pub fn write_to(&self, headers: &mut HeaderMap) -> AuthResult<()> {
        let value = |raw: &str| {
            HeaderValue::from_str(raw).map_err(|err| AuthError::Malformed(err.to_string()))
        };
        headers.insert(SCOPE_HEADER, value(self.scope.as_str())?);
        headers.insert(TIMESTAMP_HEADER, value(&self.timestamp.to_string())?);
        headers.insert(NONCE_HEADER, value(&self.nonce)?);
        headers.insert(SIGNATURE_HEADER, value(&self.signature)?);
        Ok(())
    }

    /// Reads the header set from an HTTP header map.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingHeader`] or [`AuthError::Malformed`].
    pub fn from_header_map(headers: &HeaderMap) -> AuthResult<Self> {
        let read = |name: &HeaderName, label: &'static str| -> AuthResult<String> {
            headers
                .get(name)
                .ok_or(AuthError::MissingHeader(label))?
                .to_str()
                .map(str::to_owned)
                .map_err(|_| AuthError::Malformed(format!("{label} is not ascii")))
        };
        let scope = read(&SCOPE_HEADER, "x-gateway-scope")?.parse()?;
        let timestamp = read(&TIMESTAMP_HEADER, "x-gateway-timestamp")?
            .parse()
            .map_err(|_| AuthError::Malformed("timestamp is not an integer".into()))?;
        Ok(Self {
            scope,
            timestamp,
            nonce: read(&NONCE_HEADER, "x-gateway-nonce")?,
            signature: read(&SIGNATURE_HEADER, "x-gateway-signature")?,
        })
    }
}

/// Key material for both sides of the protocol.
///
/// A signer needs the secret or signing key for the scopes it uses; a verifier
/// needs the secret or verifying key for the scopes it accepts.
#[derive(Clone, Default)]
pub struct AuthKeys {
    shared_secret: Option<Vec<u8>>,
    signing_key: Option<SigningKey>,
    verifying_key: Option<VerifyingKey>,
}

impl fmt::Debug for AuthKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKeys")
            .field("shared_secret", &self.shared_secret.is_some())
            .field("signing_key", &self.signing_key.is_some())
            .field("verifying_key", &self.verifying_key)
            .finish()
    }
}

impl AuthKeys {
    /// Creates keys with the HMAC shared secret.
    #[must_use]
    pub fn with_shared_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            shared_secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Adds an Ed25519 signing key for the privileged scope. Also installs the
    /// matching verifying key when none is set.
    #[must_use]
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        if self.verifying_key.is_none() {
            self.verifying_key = Some(key.verifying_key());
        }
        self.signing_key = Some(key);
        self
    }

    /// Adds the Ed25519 verifying key accepted for the privileged scope.
    #[must_use]
    pub fn with_verifying_key(mut self, key: VerifyingKey) -> Self {
        self.verifying_key = Some(key);
        self
    }
}

/// Builds and verifies internal auth headers.
pub struct InternalAuthCodec {
    keys: AuthKeys,
    freshness_window: u64,
    nonces: NonceCache,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InternalAuthCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalAuthCodec")
            .field("keys", &self.keys)
            .field("freshness_window", &self.freshness_window)
            .field("remembered_nonces", &self.nonces.len())
            .finish_non_exhaustive()
    }
}

impl InternalAuthCodec {
    /// Creates a codec using the system clock.
    #[must_use]
    pub fn new(keys: AuthKeys, freshness_window_secs: u64, nonce_capacity: NonZeroUsize) -> Self {
        Self::with_clock(
            keys,
            freshness_window_secs,
            nonce_capacity,
            Arc::new(SystemClock),
        )
    }

    /// Creates a codec with an explicit clock.
    #[must_use]
    pub fn with_clock(
        keys: AuthKeys,
        freshness_window_secs: u64,
        nonce_capacity: NonZeroUsize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            freshness_window: freshness_window_secs,
            nonces: NonceCache::new(nonce_capacity),
            clock,
        }
    }

    /// Signs a request, generating a fresh timestamp and nonce.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ScopeNotConfigured`] when this side holds no signing
    /// material for `scope`, or [`AuthError::Malformed`] for invalid fields.
    pub fn build_headers(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        scope: AuthScope,
    ) -> AuthResult<AuthHeaders> {
        let nonce = Uuid::new_v4().simple().to_string();
        self.build_headers_at(method, path, body, scope, self.clock.now_secs(), nonce)
    }

    /// Signs a request with an explicit timestamp and nonce.
    ///
    /// # Errors
    ///
    /// See [`InternalAuthCodec::build_headers`].
    pub fn build_headers_at(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        scope: AuthScope,
        timestamp: u64,
        nonce: String,
    ) -> AuthResult<AuthHeaders> {
        let canonical = canonical_string(method, path, body, timestamp, &nonce)?;
        let signature = match scope {
            AuthScope::Internal => {
                let secret = self
                    .keys
                    .shared_secret
                    .as_deref()
                    .ok_or(AuthError::ScopeNotConfigured(scope))?;
                STANDARD_NO_PAD.encode(hmac_tag(secret, &canonical)?)
            }
            AuthScope::Privileged => {
                let key = self
                    .keys
                    .signing_key
                    .as_ref()
                    .ok_or(AuthError::ScopeNotConfigured(scope))?;
                STANDARD_NO_PAD.encode(key.sign(canonical.as_bytes()).to_bytes())
            }
        };

        Ok(AuthHeaders {
            scope,
            timestamp,
            nonce,
            signature,
        })
    }

    /// Verifies a signed request.
    ///
    /// Checks run in order: freshness, signature, nonce. The nonce is only
    /// remembered once the signature is valid, so unsigned traffic cannot
    /// fill the replay cache.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the first failed check.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &AuthHeaders,
    ) -> AuthResult<()> {
        let result = self.verify_inner(method, path, body, headers);
        match &result {
            Ok(()) => debug!(scope = %headers.scope, method, path, "internal request verified"),
            Err(err) => warn!(scope = %headers.scope, method, path, reason = %err, "internal request rejected"),
        }
        result
    }

    fn verify_inner(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &AuthHeaders,
    ) -> AuthResult<()> {
        let now = self.clock.now_secs();
        if now.abs_diff(headers.timestamp) > self.freshness_window {
            return Err(AuthError::StaleTimestamp {
                timestamp: headers.timestamp,
                now,
            });
        }

        let canonical = canonical_string(method, path, body, headers.timestamp, &headers.nonce)?;
        let provided = STANDARD_NO_PAD
            .decode(headers.signature.trim_end_matches('='))
            .map_err(|_| AuthError::BadSignature)?;

        match headers.scope {
            AuthScope::Internal => {
                let secret = self
                    .keys
                    .shared_secret
                    .as_deref()
                    .ok_or(AuthError::ScopeNotConfigured(headers.scope))?;
                let expected = hmac_tag(secret, &canonical)?;
                if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
                    return Err(AuthError::BadSignature);
                }
            }
            AuthScope::Privileged => {
                let key = self
                    .keys
                    .verifying_key
                    .as_ref()
                    .ok_or(AuthError::ScopeNotConfigured(headers.scope))?;
                let signature =
                    Signature::from_slice(&provided).map_err(|_| AuthError::BadSignature)?;
                key.verify(canonical.as_bytes(), &signature)
                    .map_err(|_| AuthError::BadSignature)?;
            }
        }

        // Remembered until the timestamp can no longer pass the freshness check.
        let expires_at = headers
            .timestamp
            .saturating_add(self.freshness_window)
            .saturating_add(1);
        self.nonces
            .check_and_insert(&headers.nonce, now, expires_at)
    }

    /// Forgets all remembered nonces.
    pub fn clear_nonces(&self) {
        self.nonces.clear();
    }
}

fn hmac_tag(secret: &[u8], canonical: &str) -> AuthResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| AuthError::Malformed(format!("invalid signing key: {err}")))?;
    mac.update(canonical.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn canonical_string(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: u64,
    nonce: &str,
) -> AuthResult<String> {
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(AuthError::Malformed(format!("invalid method `{method}`")));
    }
    if path.is_empty() || path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(AuthError::Malformed("invalid request path".into()));
    }
    if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&nonce.len())
        || !nonce
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(AuthError::Malformed("invalid nonce".into()));
    }

    let body_digest = hex::encode(Sha256::digest(body));
    Ok(format!(
        "{}\n{path}\n{body_digest}\n{timestamp}\n{nonce}",
        method.to_ascii_uppercase()
    ))
}
