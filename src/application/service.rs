//! Submission, status and download entry points used by the HTTP adapter.

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::error::DomainError;
use crate::domain::sources::{SourceDocument, SourceKind, stored_source_name};
use crate::domain::tasks::{CompilationTask, TaskId, TaskStatus};
use crate::infra::uploads::{SourceStorage, UploadStorageError};

use super::dispatcher::QueueDispatcher;
use super::store::{StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error(transparent)]
    Storage(#[from] UploadStorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("task not found")]
    NotFound,
    #[error("task is {} and has no PDF yet", .0.as_str())]
    NotReady(TaskStatus),
    #[error("PDF artifact is no longer available")]
    Missing,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Point-in-time view of a task for status polling.
#[derive(Debug, Clone)]
pub struct TaskStatusView {
    pub task: CompilationTask,
    pub duration_ms: Option<i64>,
    pub queue_position: Option<usize>,
}

impl TaskStatusView {
    pub fn download_ready(&self) -> bool {
        self.task.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactDownload {
    pub path: PathBuf,
    pub file_name: String,
}

pub struct CompilationService {
    store: Arc<dyn TaskStore>,
    dispatcher: QueueDispatcher,
    sources: Arc<SourceStorage>,
}

impl CompilationService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: QueueDispatcher,
        sources: Arc<SourceStorage>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            sources,
        }
    }

    /// Persist an uploaded source and queue a task for it.
    ///
    /// Nothing is registered when the upload cannot be stored.
    pub async fn submit<S>(&self, original_name: &str, payload: S) -> Result<TaskId, SubmitError>
    where
        S: futures::Stream<Item = Result<Bytes, UploadStorageError>>,
    {
        let kind = SourceKind::from_file_name(original_name)?;
        let id = TaskId::new();
        let now = OffsetDateTime::now_utc();
        let stored_name = stored_source_name(original_name, kind, id, now);

        let stored = self.sources.store_stream(&stored_name, payload).await?;
        let source = SourceDocument::new(stored.path, stored.stored_name, kind);
        let task = CompilationTask::queued(id, original_name, source, now);

        if let Err(err) = self.dispatcher.submit(task).await {
            if let Err(cleanup) = self.sources.delete(&stored_name).await {
                warn!(
                    target = "texforge::service",
                    op = "submit",
                    result = "orphaned_upload",
                    task_id = %id,
                    stored_name = %stored_name,
                    error = %cleanup,
                    "Failed to delete upload of a task that was not queued"
                );
            }
            return Err(err.into());
        }

        info!(
            target = "texforge::service",
            op = "submit",
            result = "queued",
            task_id = %id,
            original_name,
            size_bytes = stored.size_bytes,
            checksum = %stored.checksum,
            "Compilation task queued"
        );
        Ok(id)
    }

    pub async fn status(&self, id: TaskId) -> Result<Option<TaskStatusView>, StoreError> {
        let Some(task) = self.store.get(id).await? else {
            return Ok(None);
        };

        let queue_position = if task.status == TaskStatus::Queued {
            self.store.queue_position(id).await?
        } else {
            None
        };
        let duration_ms = task.duration_ms(OffsetDateTime::now_utc());

        Ok(Some(TaskStatusView {
            task,
            duration_ms,
            queue_position,
        }))
    }

    /// Locate the PDF for a completed task.
    pub async fn artifact(&self, id: TaskId) -> Result<ArtifactDownload, ArtifactError> {
        let task = self.store.get(id).await?.ok_or(ArtifactError::NotFound)?;
        if task.status != TaskStatus::Completed {
            return Err(ArtifactError::NotReady(task.status));
        }

        let path = task.artifact_path.clone().ok_or(ArtifactError::Missing)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ArtifactError::Missing);
        }

        Ok(ArtifactDownload {
            path,
            file_name: task.download_file_name(),
        })
    }
}
