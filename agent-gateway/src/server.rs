//! HTTP transport for the execution RPC.
//!
//! Every request except `GET /healthz` is handed to [`Gateway::execute`]
//! untouched, so routing, authentication and payload parsing stay in one
//! place. Accepted executions stream back as newline-delimited JSON, one
//! [`ExecutionEvent`](gateway_kernel::ExecutionEvent) per line.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use gateway_kernel::{ExecutionStream, Gateway, GatewayError, ManagerError};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Content type of streamed execution events.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Path of the unauthenticated health report.
pub const HEALTH_PATH: &str = "/healthz";

/// Builds the router serving `gateway`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(dispatch)
        .with_state(gateway)
}

/// Serves `gateway` on `listener` until `shutdown` resolves.
///
/// Open execution streams keep the server alive after `shutdown` fires, so
/// callers should destroy the gateway inside `shutdown` to end them.
///
/// # Errors
///
/// Returns the IO error that stopped the accept loop.
pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "execution rpc listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let tracker = gateway.health();
    Json(json!({
        "state": gateway.state(),
        "overall": tracker.overall(),
        "services": tracker.snapshot(),
    }))
}

async fn dispatch(
    State(gateway): State<Arc<Gateway>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match gateway.execute(method.as_str(), uri.path(), &body, &headers) {
        Ok(stream) => {
            debug!(execution_key = %stream.execution_key(), "execution accepted");
            ndjson(stream)
        }
        Err(err) => rejection(&err),
    }
}

fn ndjson(stream: ExecutionStream) -> Response {
    let lines = stream.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            line
        })
    });
    let mut response = Body::from_stream(lines).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    response
}

fn rejection(err: &GatewayError) -> Response {
    let status = status_for(err);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Maps a gateway error onto the HTTP status returned to the caller.
#[must_use]
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NotReady(_) | GatewayError::Manager(ManagerError::ShuttingDown) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GatewayError::UnsupportedRoute { .. } => StatusCode::NOT_FOUND,
        GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
        GatewayError::Approval(_) => StatusCode::FORBIDDEN,
        GatewayError::InvalidPayload(_) | GatewayError::Identifier(_) => StatusCode::BAD_REQUEST,
        GatewayError::MissingBackend
        | GatewayError::InvalidKey { .. }
        | GatewayError::Policy(_)
        | GatewayError::Pool(_)
        | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
