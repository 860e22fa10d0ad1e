use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::application::service::TaskStatusView;
use crate::domain::tasks::{TaskId, TaskStatus};

/// Envelope shared by every JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub task_id: TaskId,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<TaskStatusView> for TaskStatusResponse {
    fn from(view: TaskStatusView) -> Self {
        let download_url = view
            .download_ready()
            .then(|| format!("/api/download/{}", view.task.id));
        let task = view.task;

        Self {
            task_id: task.id,
            status: task.status,
            created_at: format_timestamp(task.created_at),
            started_at: task.started_at.map(format_timestamp),
            completed_at: task.completed_at.map(format_timestamp),
            duration_ms: view.duration_ms,
            queue_position: view.queue_position,
            error_message: task.error_message,
            download_url,
        }
    }
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}
