use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::fs;

use crate::application::service::{ArtifactDownload, ArtifactError, SubmitError};
use crate::domain::tasks::TaskId;
use crate::infra::uploads::UploadStorageError;

use super::error::{ApiError, codes};
use super::models::{ApiResponse, TaskStatusResponse, UploadResponse};
use super::state::HttpState;

const UPLOAD_FIELD: &str = "file";
const UPLOAD_SOURCE: &str = "infra::http::upload";

pub async fn upload(
    State(state): State<HttpState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let limit_bytes = state.upload_limit_bytes;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            too_large(limit_bytes).caused_by(&err)
        } else {
            ApiError::bad_request(UPLOAD_SOURCE, "Upload form data was invalid").caused_by(&err)
        }
    })? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let Some(file_name) = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
        else {
            return Err(ApiError::bad_request(UPLOAD_SOURCE, "No file was uploaded"));
        };

        let payload = field.map(|chunk| {
            chunk.map_err(|err| {
                if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    UploadStorageError::PayloadTooLarge {
                        source: Box::new(err),
                    }
                } else {
                    UploadStorageError::PayloadStream {
                        source: Box::new(err),
                    }
                }
            })
        });

        let task_id = state
            .service
            .submit(&file_name, payload)
            .await
            .map_err(|err| submit_error_to_api(err, limit_bytes))?;

        let body = ApiResponse::ok(UploadResponse {
            task_id,
            message: "File uploaded and queued for compilation".to_string(),
        });
        return Ok((StatusCode::OK, Json(body)));
    }

    Err(ApiError::bad_request(UPLOAD_SOURCE, "No file was uploaded"))
}

pub async fn status(
    State(state): State<HttpState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatusResponse>>, ApiError> {
    const SOURCE: &str = "infra::http::status";

    let id = parse_task_id(SOURCE, &raw_id)?;
    let view = state
        .service
        .status(id)
        .await
        .map_err(|err| ApiError::internal(SOURCE, codes::STORE, &err))?
        .ok_or_else(|| ApiError::not_found(SOURCE, "Task not found"))?;

    Ok(Json(ApiResponse::ok(TaskStatusResponse::from(view))))
}

pub async fn download(
    State(state): State<HttpState>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    const SOURCE: &str = "infra::http::download";

    let id = parse_task_id(SOURCE, &raw_id)?;
    let artifact = state
        .service
        .artifact(id)
        .await
        .map_err(|err| match err {
            ArtifactError::NotFound => ApiError::not_found(SOURCE, "Task not found"),
            ArtifactError::NotReady(_) => ApiError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                codes::NOT_READY,
                "Compilation has not completed",
            )
            .caused_by(&err),
            ArtifactError::Missing => ApiError::not_found(SOURCE, "PDF file not found"),
            ArtifactError::Store(ref inner) => ApiError::internal(SOURCE, codes::STORE, inner),
        })?;

    match fs::read(&artifact.path).await {
        Ok(bytes) => Ok(pdf_response(&artifact, bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found(SOURCE, "PDF file not found").caused_by(&err))
        }
        Err(err) => Err(ApiError::internal(SOURCE, codes::DOWNLOAD, &err)),
    }
}

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn parse_task_id(source: &'static str, raw: &str) -> Result<TaskId, ApiError> {
    raw.parse::<TaskId>()
        .map_err(|_| ApiError::bad_request(source, "Invalid task id"))
}

fn pdf_response(artifact: &ArtifactDownload, bytes: Vec<u8>) -> Response {
    let length = bytes.len();
    let mut response = Response::new(Body::from(bytes));

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let safe_name = artifact.file_name.replace(['"', '\\'], "'");
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{safe_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    response
}

fn too_large(limit_bytes: u64) -> ApiError {
    let limit_mib = limit_bytes.div_ceil(1_048_576);
    ApiError::new(
        UPLOAD_SOURCE,
        StatusCode::PAYLOAD_TOO_LARGE,
        codes::PAYLOAD_TOO_LARGE,
        format!("File is too large (limit is {limit_mib} MiB)"),
    )
}

fn submit_error_to_api(err: SubmitError, limit_bytes: u64) -> ApiError {
    match err {
        SubmitError::Rejected(err) => ApiError::new(
            UPLOAD_SOURCE,
            StatusCode::BAD_REQUEST,
            codes::UNSUPPORTED_SOURCE,
            err.to_string(),
        ),
        SubmitError::Storage(UploadStorageError::EmptyPayload) => {
            ApiError::bad_request(UPLOAD_SOURCE, "Uploaded file is empty")
        }
        SubmitError::Storage(
            err @ (UploadStorageError::PayloadTooLarge { .. } | UploadStorageError::SizeOverflow),
        ) => too_large(limit_bytes).caused_by(&err),
        SubmitError::Storage(err @ UploadStorageError::PayloadStream { .. }) => {
            ApiError::bad_request(UPLOAD_SOURCE, "Upload form data was invalid").caused_by(&err)
        }
        SubmitError::Storage(err @ UploadStorageError::InvalidPath) => {
            ApiError::bad_request(UPLOAD_SOURCE, "Invalid file name").caused_by(&err)
        }
        SubmitError::Storage(err) => ApiError::internal(UPLOAD_SOURCE, codes::UPLOAD, &err),
        SubmitError::Store(err) => ApiError::internal(UPLOAD_SOURCE, codes::STORE, &err),
    }
}
