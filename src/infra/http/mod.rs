//! HTTP adapter over the compilation service.

mod error;
mod handlers;
mod middleware;
mod models;
mod state;

pub use error::{ApiError, ErrorReport, codes};
pub use middleware::{REQUEST_ID_HEADER, RequestId};
pub use models::{ApiResponse, TaskStatusResponse, UploadResponse};
pub use state::HttpState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

pub fn build_router(state: HttpState) -> Router {
    let upload_body_limit = usize::try_from(state.upload_limit_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/api/upload",
            post(handlers::upload).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/api/status/{task_id}", get(handlers::status))
        .route("/api/download/{task_id}", get(handlers::download))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::assign_request_id))
}
