mod common;

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{Script, ScriptedBackend, success, system};
use ed25519_dalek::SigningKey;
use futures::StreamExt;
use gateway_auth::{
    AccessToken, ApprovalClaims, ApprovalError, AuthError, AuthKeys, AuthScope, BrokerError,
    BrokerResult, CredentialBroker, InternalAuthCodec, ManualClock, SignedApproval,
    APPROVAL_VERSION, params_hash,
};
use gateway_config::{GatewayConfig, PolicyConfig, SandboxConfig};
use gateway_kernel::{
    EXECUTE_PATH, ExecutionEvent, Gateway, GatewayError, GatewayState, SECRET_STORE_SERVICE,
};
use gateway_primitives::ServiceId;
use gateway_sandbox::{SandboxClearance, SandboxGate};
use gateway_telemetry::HealthStatus;
use http::HeaderMap;
use serde_json::{Value, json};

const NOW: u64 = 1_700_000_000;
const SHARED_SECRET: &str = "internal-shared-secret";
const PRIVILEGED_SEED: [u8; 32] = [7; 32];
const APPROVER_SEED: [u8; 32] = [9; 32];

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.shared_secret = Some(SHARED_SECRET.to_owned());
    config.auth.signing_key = Some(STANDARD.encode(PRIVILEGED_SEED));
    config.policy = PolicyConfig {
        resolve_symlinks: false,
        ..PolicyConfig::default()
    };
    config.health.services = vec![ServiceId::new("gmail").unwrap()];
    config
}

fn clearance() -> SandboxClearance {
    SandboxGate::new(&SandboxConfig::default()).evaluate().unwrap()
}

fn caller(clock: &Arc<ManualClock>) -> InternalAuthCodec {
    InternalAuthCodec::with_clock(
        AuthKeys::with_shared_secret(SHARED_SECRET)
            .with_signing_key(SigningKey::from_bytes(&PRIVILEGED_SEED)),
        300,
        NonZeroUsize::new(16).unwrap(),
        Arc::clone(clock) as Arc<dyn gateway_auth::Clock>,
    )
}

struct Harness {
    gateway: Gateway,
    clock: Arc<ManualClock>,
    backend: Arc<ScriptedBackend>,
}

fn harness(broker: Option<Arc<dyn CredentialBroker>>) -> Harness {
    let clock = Arc::new(ManualClock::new(NOW));
    let backend = ScriptedBackend::new([]);
    let mut builder = Gateway::builder()
        .backend(Arc::clone(&backend) as Arc<dyn gateway_adapters::ConversationBackend>)
        .clock(Arc::clone(&clock) as Arc<dyn gateway_auth::Clock>);
    if let Some(broker) = broker {
        builder = builder.broker(broker);
    }
    Harness {
        gateway: builder.build(&config(), clearance()).unwrap(),
        clock,
        backend,
    }
}

fn body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "prompt": "draft a reply",
        "tier": "read_only",
        "poolKey": "tenant-a",
        "executionKey": "chat-1",
        "options": {"max_turns": 3}
    }))
    .unwrap()
}

fn signed(codec: &InternalAuthCodec, body: &[u8], scope: AuthScope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    codec
        .build_headers("POST", EXECUTE_PATH, body, scope)
        .unwrap()
        .write_to(&mut headers)
        .unwrap();
    headers
}

#[tokio::test]
async fn signed_request_runs_and_resumes() {
    let harness = harness(None);
    harness
        .backend
        .push(Script::steps(vec![system("sess-1"), success()]));
    harness.backend.push(Script::steps(vec![success()]));
    let caller = caller(&harness.clock);
    let body = body();

    let headers = signed(&caller, &body, AuthScope::Internal);
    let events: Vec<_> = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        events[0],
        ExecutionEvent::System {
            session_id: "sess-1".into()
        }
    );
    assert!(events.last().and_then(ExecutionEvent::summary).unwrap().success);

    let headers = signed(&caller, &body, AuthScope::Privileged);
    let stream = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap();
    assert_eq!(stream.execution_key().as_str(), "chat-1");
    stream.collect::<Vec<_>>().await;

    assert_eq!(
        harness.backend.resumes(),
        vec![None, Some("sess-1".to_owned())]
    );
}

#[tokio::test]
async fn replayed_tampered_and_stale_requests_are_rejected() {
    let harness = harness(None);
    harness.backend.push(Script::steps(vec![success()]));
    let caller = caller(&harness.clock);
    let body = body();

    let headers = signed(&caller, &body, AuthScope::Internal);
    harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap()
        .collect::<Vec<_>>()
        .await;

    let replay = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap_err();
    assert!(matches!(replay, GatewayError::Auth(AuthError::ReplayedNonce)));

    let headers = signed(&caller, &body, AuthScope::Internal);
    let mut tampered = body.clone();
    tampered[2] ^= 0x01;
    let err = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &tampered, &headers)
        .unwrap_err();
    assert!(matches!(err, GatewayError::Auth(AuthError::BadSignature)));

    let headers = signed(&caller, &body, AuthScope::Internal);
    harness.clock.advance(301);
    let err = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth(AuthError::StaleTimestamp { .. })
    ));
    assert_eq!(harness.backend.opened(), 1);
}

#[tokio::test]
async fn unsigned_or_misrouted_requests_never_reach_the_backend() {
    let harness = harness(None);
    let body = body();

    let err = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &HeaderMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth(AuthError::MissingHeader(_))
    ));

    let caller = caller(&harness.clock);
    let headers = signed(&caller, &body, AuthScope::Internal);
    let err = harness
        .gateway
        .execute("POST", "/v1/other", &body, &headers)
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnsupportedRoute { .. }));

    let garbage = b"{\"prompt\": 1}".to_vec();
    let headers = signed(&caller, &garbage, AuthScope::Internal);
    let err = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &garbage, &headers)
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidPayload(_)));
    assert_eq!(harness.backend.opened(), 0);
}

struct StaticBroker {
    public_key: Result<String, String>,
}

#[async_trait]
impl CredentialBroker for StaticBroker {
    async fn access_token(&self, _service: &ServiceId) -> BrokerResult<AccessToken> {
        Err(BrokerError::from_raw("not used"))
    }

    async fn public_key(&self) -> BrokerResult<String> {
        self.public_key.clone().map_err(BrokerError::from_raw)
    }
}

fn claims(params: &Value) -> ApprovalClaims {
    ApprovalClaims {
        version: APPROVAL_VERSION,
        issuer: "secret-store".into(),
        audience: "agent-gateway".into(),
        issued_at: NOW - 10,
        expires_at: NOW + 120,
        token_id: "tok-1".into(),
        approval_nonce: "n-1".into(),
        acting_user_id: "user-1".into(),
        provider_id: "google".into(),
        service: "gmail".into(),
        action: "send_message".into(),
        subject_user_id: None,
        params_hash: params_hash(params),
    }
}

#[tokio::test]
async fn approval_is_single_use_and_reports_secret_store_health() {
    let approver = SigningKey::from_bytes(&APPROVER_SEED);
    let broker = Arc::new(StaticBroker {
        public_key: Ok(STANDARD.encode(approver.verifying_key().to_bytes())),
    });
    let harness = harness(Some(broker));
    let params = json!({"to": "a@example.com", "subject": "hi"});
    let approval = SignedApproval::issue(&claims(&params), &approver).unwrap();

    let verified = harness
        .gateway
        .verify_approval(&approval, &params)
        .await
        .unwrap();
    assert_eq!(verified.token_id, "tok-1");

    let err = harness
        .gateway
        .verify_approval(&approval, &params)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Approval(ApprovalError::Reused(_))));

    let secret_store = ServiceId::new(SECRET_STORE_SERVICE).unwrap();
    assert_eq!(harness.gateway.health().status(&secret_store), HealthStatus::Ok);
    assert_eq!(harness.gateway.health().snapshot().len(), 2);
}

#[tokio::test]
async fn misconfigured_broker_fails_closed() {
    let broker = Arc::new(StaticBroker {
        public_key: Err("invalid_client: unknown client id".into()),
    });
    let harness = harness(Some(broker));
    let approver = SigningKey::from_bytes(&APPROVER_SEED);
    let params = json!({"to": "a@example.com"});
    let approval = SignedApproval::issue(&claims(&params), &approver).unwrap();

    let err = harness
        .gateway
        .verify_approval(&approval, &params)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Approval(ApprovalError::PublicKeyUnavailable(_))
    ));
    let secret_store = ServiceId::new(SECRET_STORE_SERVICE).unwrap();
    assert_eq!(
        harness.gateway.health().status(&secret_store),
        HealthStatus::ConfigError
    );
}

#[tokio::test]
async fn destroy_is_idempotent_and_rejects_later_requests() {
    let harness = harness(None);
    let caller = caller(&harness.clock);
    let body = body();
    assert_eq!(harness.gateway.state(), GatewayState::Ready);

    harness.gateway.destroy().await;
    harness.gateway.destroy().await;
    assert_eq!(harness.gateway.state(), GatewayState::Destroyed);
    assert!(harness.gateway.manager().is_shut_down());

    let headers = signed(&caller, &body, AuthScope::Internal);
    let err = harness
        .gateway
        .execute("POST", EXECUTE_PATH, &body, &headers)
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::NotReady(GatewayState::Destroyed)
    ));
}

#[test]
fn build_requires_backend_and_valid_config() {
    let err = Gateway::builder().build(&config(), clearance()).unwrap_err();
    assert!(matches!(err, GatewayError::MissingBackend));

    let backend = ScriptedBackend::new([]);
    let mut unsigned = config();
    unsigned.auth.shared_secret = None;
    let err = Gateway::builder()
        .backend(backend as Arc<dyn gateway_adapters::ConversationBackend>)
        .build(&unsigned, clearance())
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}
