//! Credential broker backed by the remote secret store.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_auth::{AccessToken, BrokerError, BrokerResult, CredentialBroker, ErrorClass};
use gateway_config::SecretStoreConfig;
use gateway_primitives::ServiceId;
use hyper::body::to_bytes;
use hyper::client::HttpConnector;
use hyper::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use hyper::{Body, Client, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

type StoreClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Idle keep-alive connections to the store are dropped after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the secret store: TLS against the Mozilla root set, with plain
/// `http://` accepted for a loopback store.
fn store_client() -> StoreClient {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    let tls = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(connector)
}

/// Fetches short-lived tokens and the approval key over HTTP(S).
///
/// * `GET {base}v1/tokens/{service}` returns
///   `{"ok": true, "token": "...", "expiresAt": <unix seconds>}` or
///   `{"ok": false, "error": "...", "errorClass": "..."}`.
/// * `GET {base}v1/approval-key` returns `{"ok": true, "publicKey": "<base64>"}`.
pub struct SecretStoreBroker {
    client: StoreClient,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl fmt::Debug for SecretStoreBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStoreBroker")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SecretStoreBroker {
    /// Creates a broker from configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ErrorClass::ConfigError`] broker error when the base URL is
    /// missing or invalid.
    pub fn new(config: &SecretStoreConfig) -> BrokerResult<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            BrokerError::new(ErrorClass::ConfigError, "secret store base URL is not configured")
        })?;
        Ok(Self {
            client: store_client(),
            base_url: sanitize_base_url(base_url)?,
            api_token: config.api_token.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    fn endpoint(&self, path: &str) -> BrokerResult<Uri> {
        format!("{}{path}", self.base_url)
            .parse::<Uri>()
            .map_err(|err| {
                BrokerError::new(ErrorClass::ConfigError, format!("invalid secret store endpoint: {err}"))
            })
    }

    async fn get(&self, uri: Uri) -> BrokerResult<Vec<u8>> {
        let mut builder = Request::get(uri.clone()).header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.api_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty()).map_err(|err| {
            BrokerError::new(ErrorClass::ConfigError, format!("failed to build secret store request: {err}"))
        })?;

        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| BrokerError::new(ErrorClass::Transient, "secret store request timed out"))?
            .map_err(|err| {
                BrokerError::new(ErrorClass::Transient, format!("secret store request failed: {err}"))
            })?;

        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.map_err(|err| {
            BrokerError::new(ErrorClass::Transient, format!("failed to read secret store response: {err}"))
        })?;
        debug!(%uri, %status, "secret store responded");

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(BrokerError::from_raw(format!(
                "secret store returned {status}: {body}"
            )));
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenReply {
    ok: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_class: Option<ErrorClass>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyReply {
    ok: bool,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_token_reply(bytes: &[u8]) -> BrokerResult<AccessToken> {
    let reply: TokenReply = serde_json::from_slice(bytes).map_err(|err| {
        BrokerError::new(ErrorClass::Transient, format!("malformed token reply: {err}"))
    })?;
    if !reply.ok {
        let message = reply.error.unwrap_or_else(|| "token request refused".to_owned());
        return Err(match reply.error_class {
            Some(class) => BrokerError::new(class, message),
            None => BrokerError::from_raw(message),
        });
    }
    let token = reply
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| BrokerError::new(ErrorClass::Transient, "token reply missing token"))?;
    let expires_at = reply
        .expires_at
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| BrokerError::new(ErrorClass::Transient, "token reply missing expiresAt"))?;
    Ok(AccessToken { token, expires_at })
}

fn parse_key_reply(bytes: &[u8]) -> BrokerResult<String> {
    let reply: KeyReply = serde_json::from_slice(bytes).map_err(|err| {
        BrokerError::new(ErrorClass::Transient, format!("malformed key reply: {err}"))
    })?;
    match (reply.ok, reply.public_key) {
        (true, Some(key)) if !key.trim().is_empty() => Ok(key),
        (true, _) => Err(BrokerError::new(ErrorClass::Transient, "key reply missing publicKey")),
        (false, _) => Err(BrokerError::from_raw(
            reply.error.unwrap_or_else(|| "public key request refused".to_owned()),
        )),
    }
}

#[async_trait]
impl CredentialBroker for SecretStoreBroker {
    async fn access_token(&self, service: &ServiceId) -> BrokerResult<AccessToken> {
        let uri = self.endpoint(&format!("v1/tokens/{service}"))?;
        parse_token_reply(&self.get(uri).await?)
    }

    async fn public_key(&self) -> BrokerResult<String> {
        let uri = self.endpoint("v1/approval-key")?;
        parse_key_reply(&self.get(uri).await?)
    }
}

fn sanitize_base_url(input: &str) -> BrokerResult<String> {
    let mut base = input.trim().to_owned();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(BrokerError::new(
            ErrorClass::ConfigError,
            "secret store base URL must start with http:// or https://",
        ));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base.parse::<Uri>().map_err(|err| {
        BrokerError::new(ErrorClass::ConfigError, format!("invalid secret store base URL: {err}"))
    })?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Serves one canned HTTP response and returns the request head it saw.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn broker(base_url: String) -> SecretStoreBroker {
        SecretStoreBroker::new(&SecretStoreConfig {
            base_url: Some(base_url),
            timeout_secs: 5,
            api_token: Some("store-token".into()),
        })
        .unwrap()
    }

    #[test]
    fn base_url_requires_scheme() {
        let err = sanitize_base_url("secrets.internal").unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConfigError);
        assert_eq!(
            sanitize_base_url(" https://secrets.internal ").unwrap(),
            "https://secrets.internal/"
        );
    }

    #[test]
    fn missing_base_url_is_config_error() {
        let err = SecretStoreBroker::new(&SecretStoreConfig::default()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConfigError);
    }

    #[test]
    fn refused_token_keeps_declared_class() {
        let err = parse_token_reply(br#"{"ok": false, "error": "boom", "errorClass": "auth_expired"}"#)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::AuthExpired);

        let err = parse_token_reply(br#"{"ok": false, "error": "invalid_client"}"#).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConfigError);
    }

    #[tokio::test]
    async fn fetches_token_with_bearer_auth() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"ok": true, "token": "ya29.abc", "expiresAt": 1900000000}"#,
        )
        .await;
        let service = ServiceId::new("gmail").unwrap();
        let token = broker(base).access_token(&service).await.unwrap();

        assert_eq!(token.token, "ya29.abc");
        assert_eq!(token.expires_at.timestamp(), 1_900_000_000);
        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /v1/tokens/gmail http/1.1"));
        assert!(head.contains("authorization: bearer store-token"));
    }

    #[tokio::test]
    async fn rate_limited_status_is_classified() {
        let (base, server) = serve_once("429 Too Many Requests", r#"{"error": "slow down"}"#).await;
        let err = broker(base)
            .access_token(&ServiceId::new("calendar").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fetches_public_key() {
        let (base, server) = serve_once("200 OK", r#"{"ok": true, "publicKey": "AAAA"}"#).await;
        assert_eq!(broker(base).public_key().await.unwrap(), "AAAA");
        assert!(server.await.unwrap().starts_with("GET /v1/approval-key"));
    }
}
