use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::models::ApiResponse;

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const NOT_READY: &str = "not_ready";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const UNSUPPORTED_SOURCE: &str = "unsupported_source";
    pub const UPLOAD: &str = "upload_error";
    pub const STORE: &str = "store_error";
    pub const DOWNLOAD: &str = "download_error";
}

/// Diagnostics carried on an error response's extensions for the response
/// logger. Never serialized to the client.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub code: &'static str,
    pub chain: Vec<String>,
}

impl ErrorReport {
    pub fn new(source: &'static str, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            source,
            code,
            chain: vec![detail.into()],
        }
    }

    /// Append `error` and each of its causes.
    pub fn caused_by(mut self, error: &(dyn StdError + 'static)) -> Self {
        let mut next = Some(error);
        while let Some(current) = next {
            self.chain.push(current.to_string());
            next = current.source();
        }
        self
    }
}

/// JSON error answered in the shared `{ success: false, error }` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            status,
            report: ErrorReport::new(source, code, message.clone()),
            message,
        }
    }

    pub fn bad_request(source: &'static str, message: impl Into<String>) -> Self {
        Self::new(source, StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message)
    }

    pub fn not_found(source: &'static str, message: impl Into<String>) -> Self {
        Self::new(source, StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    /// 500 with a generic client message; `error` only reaches the logs.
    pub fn internal(
        source: &'static str,
        code: &'static str,
        error: &(dyn StdError + 'static),
    ) -> Self {
        Self::new(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            code,
            "Internal error while handling the request",
        )
        .caused_by(error)
    }

    pub fn caused_by(mut self, error: &(dyn StdError + 'static)) -> Self {
        self.report = self.report.caused_by(error);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        let mut response = (self.status, Json(body)).into_response();
        response.extensions_mut().insert(self.report);
        response
    }
}
