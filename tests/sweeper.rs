use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use filetime::FileTime;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::{Semaphore, watch};

use texforge::application::compiler::{CompilationExecutor, DocumentCompiler};
use texforge::application::store::{InMemoryTaskStore, StoreError, TaskStore};
use texforge::application::sweeper::{RetentionPolicy, RetentionSweeper, SweepCount};
use texforge::application::toolchain::{ToolRun, Toolchain, ToolchainError};
use texforge::domain::sources::{SourceDocument, SourceKind, stored_source_name};
use texforge::domain::tasks::{CompilationOutcome, CompilationTask, FailureKind, TaskId, TaskStatus};
use texforge::infra::scratch::{CleanupPolicy, DirectoryRemover, ScratchSpace};
use texforge::infra::uploads::SourceStorage;

const PREFIX: &str = "tex_compile_";

struct Layout {
    dir: TempDir,
}

impl Layout {
    fn new() -> Self {
        let layout = Self {
            dir: TempDir::new().expect("tempdir"),
        };
        for sub in ["scratch", "pdfs", "uploads", "logs"] {
            std::fs::create_dir_all(layout.path(sub)).expect("layout dir");
        }
        layout
    }

    fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    fn scratch(&self) -> ScratchSpace {
        ScratchSpace::new(
            self.path("scratch"),
            PREFIX,
            CleanupPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
                settle_delay: Duration::ZERO,
            },
        )
    }

    fn sweeper(&self, store: Arc<dyn TaskStore>, scratch: ScratchSpace) -> RetentionSweeper {
        RetentionSweeper::new(
            store,
            scratch,
            Arc::new(SourceStorage::new(self.path("uploads")).expect("source storage")),
            self.path("pdfs"),
            RetentionPolicy::default(),
        )
    }
}

fn backdate(path: &Path, age: Duration) {
    let when = SystemTime::now() - age;
    filetime::set_file_mtime(path, FileTime::from_system_time(when)).expect("set mtime");
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value * 60)
}

/// A task in `status` admitted `age` ago whose source lives in `layout`.
fn task_with_age(layout: &Layout, status: TaskStatus, age: Duration) -> CompilationTask {
    let id = TaskId::new();
    let created_at = OffsetDateTime::now_utc() - age;
    let stored_name = stored_source_name("paper.tex", SourceKind::Document, id, created_at);
    let path = layout.path("uploads").join(&stored_name);
    std::fs::write(&path, b"\\documentclass{article}").expect("write source");

    let queued = CompilationTask::queued(
        id,
        "paper.tex",
        SourceDocument::new(path, stored_name, SourceKind::Document),
        created_at,
    );
    match status {
        TaskStatus::Queued => queued,
        TaskStatus::Processing => queued.start(created_at).expect("start"),
        TaskStatus::Completed => {
            let log = layout.path("logs").join(format!("{id}.log"));
            std::fs::write(&log, b"This is pdfTeX").expect("write log");
            let artifact = layout.path("pdfs").join(queued.artifact_file_name());
            queued
                .start(created_at)
                .and_then(|running| {
                    running.finish(
                        &CompilationOutcome::Succeeded {
                            artifact,
                            log: Some(log),
                        },
                        created_at,
                    )
                })
                .expect("finish")
        }
        TaskStatus::Failed => queued
            .start(created_at)
            .and_then(|running| {
                running.finish(
                    &CompilationOutcome::failed(FailureKind::CompilerExit, "pass 1", None),
                    created_at,
                )
            })
            .expect("finish"),
    }
}

/// Parks the first latex pass until the test lets it continue.
struct GatedToolchain {
    entered: Semaphore,
    proceed: Semaphore,
    parked: AtomicBool,
}

impl GatedToolchain {
    fn new() -> Self {
        Self {
            entered: Semaphore::new(0),
            proceed: Semaphore::new(0),
            parked: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Toolchain for GatedToolchain {
    async fn compile(
        &self,
        main_document: &Path,
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError> {
        if !self.parked.swap(true, Ordering::SeqCst) {
            self.entered.add_permits(1);
            self.proceed
                .acquire()
                .await
                .expect("proceed semaphore open")
                .forget();
        }

        if !working_dir.join(main_document).is_file() {
            return Ok(ToolRun::failed(Some(1), "source vanished"));
        }
        std::fs::write(working_dir.join(main_document).with_extension("pdf"), b"%PDF")
            .expect("write pdf");
        Ok(ToolRun::succeeded(""))
    }

    async fn compile_diagrams(
        &self,
        _files: &[PathBuf],
        _working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError> {
        Ok(ToolRun::succeeded(""))
    }
}

struct StuckRemover;

#[async_trait]
impl DirectoryRemover for StuckRemover {
    async fn remove_dir_all(&self, _path: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "directory is held open",
        ))
    }
}

struct UnavailableStore;

#[async_trait]
impl TaskStore for UnavailableStore {
    async fn enqueue(&self, _task: CompilationTask) -> Result<(), StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn dequeue_next(&self) -> Result<Option<CompilationTask>, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn get(&self, _id: TaskId) -> Result<Option<CompilationTask>, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn update(&self, _task: CompilationTask) -> Result<(), StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn list_all(&self) -> Result<Vec<CompilationTask>, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn remove(&self, _id: TaskId) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn queued_len(&self) -> Result<usize, StoreError> {
        Err(StoreError::unavailable("offline"))
    }

    async fn queue_position(&self, _id: TaskId) -> Result<Option<usize>, StoreError> {
        Err(StoreError::unavailable("offline"))
    }
}

#[tokio::test]
async fn expired_scratch_directories_are_removed() {
    let layout = Layout::new();
    let old = layout.path("scratch").join(format!("{PREFIX}old"));
    let fresh = layout.path("scratch").join(format!("{PREFIX}fresh"));
    let foreign = layout.path("scratch").join("someone_else");
    for dir in [&old, &fresh, &foreign] {
        std::fs::create_dir_all(dir).expect("scratch dir");
    }
    std::fs::write(old.join("main.aux"), b"aux").expect("aux file");
    backdate(&old, minutes(30));
    backdate(&foreign, minutes(30));

    let sweeper = layout.sweeper(Arc::new(InMemoryTaskStore::new()), layout.scratch());
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert_eq!(
        report.scratch,
        SweepCount {
            deleted: 1,
            candidates: 1
        }
    );
    assert!(!old.exists());
    assert!(fresh.exists());
    assert!(foreign.exists());
}

#[tokio::test]
async fn artifacts_of_recent_tasks_survive_past_the_artifact_window() {
    let layout = Layout::new();
    let store = Arc::new(InMemoryTaskStore::new());

    let recent = task_with_age(&layout, TaskStatus::Completed, minutes(10));
    let recent_pdf = layout.path("pdfs").join(recent.artifact_file_name());
    std::fs::write(&recent_pdf, b"%PDF").expect("pdf");
    backdate(&recent_pdf, minutes(90));
    store.enqueue(recent).await.expect("enqueue");

    let orphan_pdf = layout
        .path("pdfs")
        .join(format!("20240101_120000_orphan_{}.pdf", TaskId::new()));
    std::fs::write(&orphan_pdf, b"%PDF").expect("pdf");
    backdate(&orphan_pdf, minutes(90));

    let young_pdf = layout.path("pdfs").join("young.pdf");
    std::fs::write(&young_pdf, b"%PDF").expect("pdf");

    let sweeper = layout.sweeper(store, layout.scratch());
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert!(recent_pdf.exists(), "referenced artifact must be kept");
    assert!(!orphan_pdf.exists(), "orphaned artifact must be removed");
    assert!(young_pdf.exists(), "artifact inside the window must be kept");
    assert_eq!(
        report.artifacts,
        SweepCount {
            deleted: 1,
            candidates: 2
        }
    );
}

#[tokio::test]
async fn only_old_terminal_tasks_are_evicted() {
    let layout = Layout::new();
    let store = Arc::new(InMemoryTaskStore::new());

    let expired = task_with_age(&layout, TaskStatus::Completed, minutes(180));
    let stuck = task_with_age(&layout, TaskStatus::Processing, minutes(180));
    let waiting = task_with_age(&layout, TaskStatus::Queued, minutes(180));
    let recent_failure = task_with_age(&layout, TaskStatus::Failed, minutes(30));

    let expired_source = expired.source.path.clone();
    let expired_log = expired.log_path.clone().expect("log path");
    let ids = [expired.id, stuck.id, waiting.id, recent_failure.id];
    for task in [expired, stuck, waiting, recent_failure] {
        store.enqueue(task).await.expect("enqueue");
    }

    let sweeper = layout.sweeper(store.clone(), layout.scratch());
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert_eq!(
        report.tasks,
        SweepCount {
            deleted: 1,
            candidates: 1
        }
    );
    assert!(store.get(ids[0]).await.expect("store").is_none());
    for id in &ids[1..] {
        assert!(store.get(*id).await.expect("store").is_some());
    }
    assert!(!expired_source.exists());
    assert!(!expired_log.exists());
}

#[tokio::test]
async fn stuck_scratch_removal_does_not_abort_the_cycle() {
    let layout = Layout::new();
    let held = layout.path("scratch").join(format!("{PREFIX}held"));
    std::fs::create_dir_all(&held).expect("scratch dir");
    backdate(&held, minutes(30));

    let store = Arc::new(InMemoryTaskStore::new());
    store
        .enqueue(task_with_age(&layout, TaskStatus::Failed, minutes(180)))
        .await
        .expect("enqueue");

    let scratch = layout.scratch().with_remover(Arc::new(StuckRemover));
    let sweeper = layout.sweeper(store, scratch);
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert_eq!(
        report.scratch,
        SweepCount {
            deleted: 0,
            candidates: 1
        }
    );
    assert!(held.exists());
    assert_eq!(report.tasks.deleted, 1);
}

#[tokio::test]
async fn unavailable_store_keeps_artifacts_and_tasks() {
    let layout = Layout::new();
    let pdf = layout
        .path("pdfs")
        .join(format!("20240101_120000_paper_{}.pdf", TaskId::new()));
    std::fs::write(&pdf, b"%PDF").expect("pdf");
    backdate(&pdf, minutes(90));

    let sweeper = layout.sweeper(Arc::new(UnavailableStore), layout.scratch());
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert!(pdf.exists());
    assert_eq!(report.artifacts.deleted, 0);
    assert_eq!(report.tasks, SweepCount::default());
}

#[tokio::test]
async fn spawned_sweeper_runs_until_shutdown() {
    let layout = Layout::new();
    let old = layout.path("scratch").join(format!("{PREFIX}stale"));
    std::fs::create_dir_all(&old).expect("scratch dir");
    backdate(&old, minutes(30));

    let sweeper = Arc::new(RetentionSweeper::new(
        Arc::new(InMemoryTaskStore::new()),
        layout.scratch(),
        Arc::new(SourceStorage::new(layout.path("uploads")).expect("source storage")),
        layout.path("pdfs"),
        RetentionPolicy {
            interval: Duration::from_millis(20),
            startup_delay: Duration::ZERO,
            ..RetentionPolicy::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = sweeper.spawn(shutdown_rx);

    for _ in 0..100 {
        if !old.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!old.exists());

    shutdown_tx.send(true).expect("sweeper listening");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("sweeper stops promptly")
        .expect("sweeper task");
}

#[tokio::test]
async fn live_scratch_directory_is_skipped_even_when_expired() {
    let layout = Layout::new();
    let scratch = layout.scratch();
    let live = scratch.create().await.expect("create scratch");
    backdate(&live, minutes(30));

    let sweeper = layout.sweeper(Arc::new(InMemoryTaskStore::new()), scratch.clone());
    let report = sweeper.sweep_at(OffsetDateTime::now_utc()).await;

    assert_eq!(
        report.scratch,
        SweepCount {
            deleted: 0,
            candidates: 1
        }
    );
    assert!(live.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_during_a_long_compilation_leaves_its_scratch_alone() {
    let layout = Layout::new();
    let scratch = layout.scratch();
    let toolchain = Arc::new(GatedToolchain::new());
    let executor = Arc::new(CompilationExecutor::new(
        toolchain.clone(),
        scratch.clone(),
        layout.path("pdfs"),
        layout.path("logs"),
    ));

    let task = task_with_age(&layout, TaskStatus::Queued, Duration::ZERO);
    let compile = tokio::spawn({
        let executor = executor.clone();
        async move { executor.compile(&task).await }
    });

    toolchain
        .entered
        .acquire()
        .await
        .expect("entered semaphore open")
        .forget();

    let sweeper = layout.sweeper(Arc::new(InMemoryTaskStore::new()), scratch.clone());
    let later = OffsetDateTime::now_utc() + time::Duration::minutes(20);
    let report = sweeper.sweep_at(later).await;
    assert_eq!(
        report.scratch,
        SweepCount {
            deleted: 0,
            candidates: 1
        }
    );

    toolchain.proceed.add_permits(1);
    let outcome = tokio::time::timeout(Duration::from_secs(5), compile)
        .await
        .expect("compilation finishes")
        .expect("compilation task");
    assert!(outcome.is_success(), "{outcome:?}");

    let leftovers = std::fs::read_dir(layout.path("scratch"))
        .expect("scratch root")
        .count();
    assert_eq!(leftovers, 0);
}
