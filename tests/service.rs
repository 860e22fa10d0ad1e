use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tempfile::TempDir;

use texforge::application::compiler::DocumentCompiler;
use texforge::application::dispatcher::QueueDispatcher;
use texforge::application::service::{CompilationService, SubmitError};
use texforge::application::store::{StoreError, TaskStore};
use texforge::domain::tasks::{CompilationOutcome, CompilationTask, FailureKind, TaskId};
use texforge::infra::uploads::{SourceStorage, UploadStorageError};

struct NeverCompiles;

#[async_trait]
impl DocumentCompiler for NeverCompiles {
    async fn compile(&self, _task: &CompilationTask) -> CompilationOutcome {
        CompilationOutcome::failed(FailureKind::Toolchain, "not expected", None)
    }
}

/// Refuses every admission. With `pin_upload` set it also swaps the stored
/// upload for a directory so the follow-up file deletion fails.
struct RefusingStore {
    pin_upload: bool,
}

#[async_trait]
impl TaskStore for RefusingStore {
    async fn enqueue(&self, task: CompilationTask) -> Result<(), StoreError> {
        if self.pin_upload {
            std::fs::remove_file(&task.source.path).expect("remove upload");
            std::fs::create_dir(&task.source.path).expect("pin upload path");
        }
        Err(StoreError::unavailable("admission closed"))
    }

    async fn dequeue_next(&self) -> Result<Option<CompilationTask>, StoreError> {
        Ok(None)
    }

    async fn get(&self, _id: TaskId) -> Result<Option<CompilationTask>, StoreError> {
        Ok(None)
    }

    async fn update(&self, _task: CompilationTask) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<CompilationTask>, StoreError> {
        Ok(Vec::new())
    }

    async fn remove(&self, _id: TaskId) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn queued_len(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn queue_position(&self, _id: TaskId) -> Result<Option<usize>, StoreError> {
        Ok(None)
    }
}

fn service(dir: &TempDir, store: RefusingStore) -> CompilationService {
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let dispatcher = QueueDispatcher::new(store.clone(), Arc::new(NeverCompiles));
    let sources = Arc::new(SourceStorage::new(dir.path().join("uploads")).expect("sources"));
    CompilationService::new(store, dispatcher, sources)
}

fn payload() -> impl futures::Stream<Item = Result<Bytes, UploadStorageError>> {
    stream::iter([Ok(Bytes::from_static(b"\\documentclass{article}"))])
}

fn upload_entries(dir: &TempDir) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.path().join("uploads"))
        .expect("uploads dir")
        .map(|entry| entry.expect("entry").path())
        .collect()
}

#[tokio::test]
async fn refused_admission_removes_the_stored_upload() {
    let dir = TempDir::new().expect("tempdir");
    let service = service(&dir, RefusingStore { pin_upload: false });

    let result = service.submit("paper.tex", payload()).await;

    assert!(matches!(result, Err(SubmitError::Store(_))), "{result:?}");
    assert!(upload_entries(&dir).is_empty());
}

#[tokio::test]
async fn failed_upload_cleanup_still_reports_the_admission_error() {
    let dir = TempDir::new().expect("tempdir");
    let service = service(&dir, RefusingStore { pin_upload: true });

    let result = service.submit("paper.tex", payload()).await;

    assert!(matches!(result, Err(SubmitError::Store(_))), "{result:?}");
    let leftovers = upload_entries(&dir);
    assert_eq!(leftovers.len(), 1);
    assert!(leftovers[0].is_dir());
}
