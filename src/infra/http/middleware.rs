use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::ErrorReport;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation id for one request, taken from `x-request-id` when the client
/// sends a usable one.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn assign_request_id(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let started_at = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis() as u64;

    if !(status.is_client_error() || status.is_server_error()) {
        debug!(
            target = "texforge::http",
            op = "respond",
            result = "ok",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            request_id = %request_id,
            "request handled"
        );
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, code, chain) = match report {
        Some(report) => (report.source, report.code, report.chain),
        None => ("axum", "rejected", Vec::new()),
    };

    if status.is_server_error() {
        error!(
            target = "texforge::http",
            op = "respond",
            result = "error",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            request_id = %request_id,
            source,
            error_code = code,
            chain = ?chain,
            "request failed"
        );
    } else {
        warn!(
            target = "texforge::http",
            op = "respond",
            result = "rejected",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            request_id = %request_id,
            source,
            error_code = code,
            chain = ?chain,
            "request rejected"
        );
    }

    response
}
