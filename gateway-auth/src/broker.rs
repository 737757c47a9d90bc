//! Credential broker contract.
//!
//! The gateway never stores long-lived provider credentials. A broker hands
//! out short-lived access tokens per service and the public key used to check
//! approval claims.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_primitives::ServiceId;
use gateway_telemetry::{HealthStatus, HealthTracker};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Result alias for broker calls.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Coarse classification of a broker failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Client credentials are wrong; operator action required.
    ConfigError,
    /// Refresh grant expired or was revoked; the user must re-authorise.
    AuthExpired,
    /// The upstream throttled the request.
    RateLimited,
    /// Anything else. Retrying may help.
    Transient,
}

impl ErrorClass {
    /// Classifies a raw upstream error message.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("invalid_client") {
            Self::ConfigError
        } else if lowered.contains("invalid_grant") || lowered.contains("revoked") {
            Self::AuthExpired
        } else if lowered.contains("rate") || lowered.contains("429") {
            Self::RateLimited
        } else {
            Self::Transient
        }
    }
}

/// Failure reported by a credential broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("credential broker error ({class:?}): {message}")]
pub struct BrokerError {
    message: String,
    class: ErrorClass,
}

impl BrokerError {
    /// Creates an error with an explicit class.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }

    /// Creates an error, classifying it from the message text.
    #[must_use]
    pub fn from_raw(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = ErrorClass::classify(&message);
        Self { message, class }
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the classification.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        self.class
    }
}

/// Short-lived bearer token for one external service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque bearer value.
    pub token: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    /// Returns `true` once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Source of short-lived credentials.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Returns a fresh access token for `service`.
    async fn access_token(&self, service: &ServiceId) -> BrokerResult<AccessToken>;

    /// Returns the base64 Ed25519 key that signs approval claims.
    async fn public_key(&self) -> BrokerResult<String>;
}

#[async_trait]
impl<T> CredentialBroker for Arc<T>
where
    T: CredentialBroker + ?Sized,
{
    async fn access_token(&self, service: &ServiceId) -> BrokerResult<AccessToken> {
        (**self).access_token(service).await
    }

    async fn public_key(&self) -> BrokerResult<String> {
        (**self).public_key().await
    }
}

/// Broker decorator that feeds every outcome into a [`HealthTracker`].
///
/// Token calls are attributed to the requested service. Public-key calls are
/// attributed to the secret store itself.
pub struct HealthReportingBroker<B> {
    inner: B,
    health: Arc<HealthTracker>,
    secret_store: ServiceId,
}

impl<B> HealthReportingBroker<B> {
    /// Wraps `inner`, reporting public-key outcomes under `secret_store`.
    #[must_use]
    pub fn new(inner: B, health: Arc<HealthTracker>, secret_store: ServiceId) -> Self {
        Self {
            inner,
            health,
            secret_store,
        }
    }

    /// Returns the wrapped broker.
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn report<T>(&self, service: &ServiceId, outcome: &BrokerResult<T>) -> HealthStatus {
        match outcome {
            Ok(_) => self.health.record_success(service),
            Err(err) => {
                let status = match err.class() {
                    ErrorClass::ConfigError => self.health.record_config_error(service),
                    ErrorClass::AuthExpired => self.health.record_auth_expired(service),
                    ErrorClass::RateLimited | ErrorClass::Transient => {
                        self.health.record_failure(service)
                    }
                };
                warn!(
                    service = %service,
                    class = ?err.class(),
                    status = status.as_str(),
                    error = %err.message(),
                    "credential broker call failed"
                );
                status
            }
        }
    }
}

#[async_trait]
impl<B> CredentialBroker for HealthReportingBroker<B>
where
    B: CredentialBroker,
{
    async fn access_token(&self, service: &ServiceId) -> BrokerResult<AccessToken> {
        let outcome = self.inner.access_token(service).await;
        self.report(service, &outcome);
        outcome
    }

    async fn public_key(&self) -> BrokerResult<String> {
        let outcome = self.inner.public_key().await;
        self.report(&self.secret_store, &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Scripted {
        replies: Mutex<Vec<BrokerResult<AccessToken>>>,
    }

    #[async_trait]
    impl CredentialBroker for Scripted {
        async fn access_token(&self, _service: &ServiceId) -> BrokerResult<AccessToken> {
            self.replies.lock().remove(0)
        }

        async fn public_key(&self) -> BrokerResult<String> {
            Err(BrokerError::from_raw("connection reset"))
        }
    }

    fn token() -> AccessToken {
        AccessToken {
            token: "ya29.token".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn classification_follows_error_text() {
        assert_eq!(
            ErrorClass::classify("invalid_client: unknown client id"),
            ErrorClass::ConfigError
        );
        assert_eq!(
            ErrorClass::classify("Token has been REVOKED"),
            ErrorClass::AuthExpired
        );
        assert_eq!(ErrorClass::classify("invalid_grant"), ErrorClass::AuthExpired);
        assert_eq!(ErrorClass::classify("HTTP 429"), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::classify("connection reset"), ErrorClass::Transient);
        assert_eq!(
            ErrorClass::classify("oauth error: unauthorized_client"),
            ErrorClass::Transient
        );
    }

    #[tokio::test]
    async fn outcomes_drive_health() {
        let gmail = ServiceId::new("gmail").unwrap();
        let store = ServiceId::new("secret-store").unwrap();
        let health = Arc::new(HealthTracker::new([gmail.clone(), store.clone()]));
        let broker = HealthReportingBroker::new(
            Scripted {
                replies: Mutex::new(vec![
                    Ok(token()),
                    Err(BrokerError::from_raw("invalid_client")),
                    Err(BrokerError::from_raw("invalid_grant")),
                    Ok(token()),
                ]),
            },
            Arc::clone(&health),
            store.clone(),
        );

        broker.access_token(&gmail).await.unwrap();
        assert_eq!(health.status(&gmail), HealthStatus::Ok);

        broker.access_token(&gmail).await.unwrap_err();
        assert_eq!(health.status(&gmail), HealthStatus::ConfigError);

        broker.access_token(&gmail).await.unwrap_err();
        assert_eq!(health.status(&gmail), HealthStatus::AuthExpired);

        broker.access_token(&gmail).await.unwrap();
        assert_eq!(health.status(&gmail), HealthStatus::AuthExpired);

        broker.public_key().await.unwrap_err();
        assert_eq!(health.record(&store).unwrap().failure_count(), 1);
    }

    #[tokio::test]
    async fn unrecognised_oauth_errors_count_as_transient() {
        let calendar = ServiceId::new("calendar").unwrap();
        let health = Arc::new(HealthTracker::new([calendar.clone()]));
        let broker = HealthReportingBroker::new(
            Scripted {
                replies: Mutex::new(vec![Err(BrokerError::from_raw(
                    "oauth error: unauthorized_client",
                ))]),
            },
            Arc::clone(&health),
            ServiceId::new("secret-store").unwrap(),
        );

        let err = broker.access_token(&calendar).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(health.status(&calendar), HealthStatus::Ok);
        assert_eq!(health.record(&calendar).unwrap().failure_count(), 1);
    }

    #[test]
    fn token_debug_is_redacted() {
        let rendered = format!("{:?}", token());
        assert!(!rendered.contains("ya29"));
    }
}
