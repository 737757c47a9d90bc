//! Trust boundary for internal callers.
//!
//! * [`headers`] signs and verifies internal RPC requests (HMAC for shared
//!   scopes, Ed25519 for privileged scopes) with a freshness window and a
//!   replay cache ([`nonce`]).
//! * [`approval`] verifies single-use, parameter-bound approval claims issued
//!   by the secret store.
//! * [`broker`] is the contract for fetching short-lived service tokens and
//!   the approval verification key.

#![warn(missing_docs, clippy::pedantic)]

pub mod approval;
pub mod broker;
pub mod clock;
pub mod headers;
pub mod nonce;

pub use approval::{
    ApprovalClaims, ApprovalError, ApprovalResult, ApprovalVerifier, SignedApproval,
    APPROVAL_VERSION, params_hash, parse_verifying_key,
};
pub use broker::{
    AccessToken, BrokerError, BrokerResult, CredentialBroker, ErrorClass, HealthReportingBroker,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use headers::{AuthError, AuthHeaders, AuthKeys, AuthResult, AuthScope, InternalAuthCodec};
pub use nonce::NonceCache;
