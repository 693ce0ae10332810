//! Per-request span for the HTTP API, keyed by `X-Request-ID`.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Caller-supplied id if it is printable, otherwise a fresh v4 uuid
fn request_id_of(request: &Request<Body>) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Wraps the handler in an `http_request` span, echoes the request id back,
/// and logs one line per request once the status is known.
pub async fn request_tracing_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let started = Instant::now();
    let request_id = request_id_of(&request);
    // Absent when the router is driven without connect info
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        client = %client,
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    span.in_scope(|| log_outcome(status, elapsed_ms));
    response
}

fn log_outcome(status: StatusCode, elapsed_ms: u64) {
    let code = status.as_u16();
    if status.is_server_error() {
        tracing::warn!(status = code, elapsed_ms, "request failed");
    } else if status.is_client_error() {
        tracing::info!(status = code, elapsed_ms, "request rejected");
    } else {
        tracing::debug!(status = code, elapsed_ms, "request served");
    }
}
