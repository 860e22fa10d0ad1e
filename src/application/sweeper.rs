//! Periodic reclamation of scratch directories, artifacts and task records.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    fs,
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, sleep},
};
use tracing::{debug, info, warn};

use crate::config::RetentionSettings;
use crate::domain::sources::task_id_from_artifact_name;
use crate::domain::tasks::CompilationTask;
use crate::infra::scratch::ScratchSpace;
use crate::infra::uploads::SourceStorage;

use super::store::{StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Retention windows and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub interval: Duration,
    pub startup_delay: Duration,
    pub scratch_retention: Duration,
    pub artifact_retention: Duration,
    pub task_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            startup_delay: Duration::from_secs(10),
            scratch_retention: Duration::from_secs(15 * 60),
            artifact_retention: Duration::from_secs(60 * 60),
            task_retention: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl From<&RetentionSettings> for RetentionPolicy {
    fn from(settings: &RetentionSettings) -> Self {
        Self {
            interval: settings.interval,
            startup_delay: settings.startup_delay,
            scratch_retention: settings.scratch_retention,
            artifact_retention: settings.artifact_retention,
            task_retention: settings.task_retention,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepCount {
    pub deleted: usize,
    pub candidates: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scratch: SweepCount,
    pub artifacts: SweepCount,
    pub tasks: SweepCount,
}

pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    scratch: ScratchSpace,
    sources: Arc<SourceStorage>,
    artifacts_dir: PathBuf,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        scratch: ScratchSpace,
        sources: Arc<SourceStorage>,
        artifacts_dir: PathBuf,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            scratch,
            sources,
            artifacts_dir,
            policy,
        }
    }

    /// Run sweeps on the configured cadence until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(self.policy.startup_delay) => {}
                _ = shutdown.changed() => return,
            }

            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep_at(OffsetDateTime::now_utc()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(
                target = "texforge::sweeper",
                op = "spawn",
                result = "stopped",
                "Retention sweeper stopped"
            );
        })
    }

    /// One full cycle. Each resource class is swept independently; a failure
    /// in one is logged and reported as an empty count.
    pub async fn sweep_at(&self, now: OffsetDateTime) -> SweepReport {
        let started_at = Instant::now();

        let report = SweepReport {
            scratch: settle("scratch", self.sweep_scratch(now).await),
            artifacts: settle("artifacts", self.sweep_artifacts(now).await),
            tasks: settle("tasks", self.sweep_tasks(now).await),
        };

        info!(
            target = "texforge::sweeper",
            op = "sweep",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            scratch = %format_count(report.scratch),
            artifacts = %format_count(report.artifacts),
            tasks = %format_count(report.tasks),
            "Retention sweep finished"
        );
        report
    }

    async fn sweep_scratch(&self, now: OffsetDateTime) -> Result<SweepCount, SweepError> {
        let cutoff = now - self.policy.scratch_retention;
        let expired = self.scratch.list_expired(cutoff).await?;
        let mut count = SweepCount {
            candidates: expired.len(),
            ..SweepCount::default()
        };

        for dir in expired {
            if self.scratch.is_in_use(&dir).await {
                debug!(
                    target = "texforge::sweeper",
                    op = "sweep_scratch",
                    result = "in_use",
                    path = %dir.display(),
                    "Skipping scratch directory that is still in use"
                );
                continue;
            }
            if self.scratch.remove_with_retry(&dir).await {
                count.deleted += 1;
            }
        }

        counter!("texforge_sweep_deleted_total", "class" => "scratch")
            .increment(count.deleted as u64);
        Ok(count)
    }

    async fn sweep_artifacts(&self, now: OffsetDateTime) -> Result<SweepCount, SweepError> {
        let cutoff = now - self.policy.artifact_retention;
        let mut entries = match fs::read_dir(&self.artifacts_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(SweepCount::default()),
            Err(err) => return Err(err.into()),
        };

        let mut count = SweepCount::default();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|value| value.to_str())
                .filter(|name| name.to_ascii_lowercase().ends_with(".pdf"))
                .map(str::to_owned)
            else {
                continue;
            };

            match artifact_modified(&path).await {
                Ok(modified) if modified < cutoff => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(
                        target = "texforge::sweeper",
                        op = "sweep_artifacts",
                        result = "error",
                        path = %path.display(),
                        error = %err,
                        "Could not read artifact timestamp"
                    );
                    continue;
                }
            }

            count.candidates += 1;
            if self.is_referenced(&name, cutoff).await {
                debug!(
                    target = "texforge::sweeper",
                    op = "sweep_artifacts",
                    result = "referenced",
                    artifact = %name,
                    "Keeping artifact owned by a recent task"
                );
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => count.deleted += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    target = "texforge::sweeper",
                    op = "sweep_artifacts",
                    result = "error",
                    path = %path.display(),
                    error = %err,
                    "Failed to delete artifact"
                ),
            }
        }

        counter!("texforge_sweep_deleted_total", "class" => "artifacts")
            .increment(count.deleted as u64);
        Ok(count)
    }

    /// An artifact is referenced while the task it maps to still exists and
    /// was created inside the artifact window. A failed lookup counts as
    /// referenced.
    async fn is_referenced(&self, artifact_name: &str, cutoff: OffsetDateTime) -> bool {
        let Some(id) = task_id_from_artifact_name(artifact_name) else {
            return false;
        };

        match self.store.get(id).await {
            Ok(Some(task)) => task.created_at > cutoff,
            Ok(None) => false,
            Err(err) => {
                warn!(
                    target = "texforge::sweeper",
                    op = "is_referenced",
                    result = "error",
                    task_id = %id,
                    error = %err,
                    "Reference check failed; keeping artifact"
                );
                true
            }
        }
    }

    async fn sweep_tasks(&self, now: OffsetDateTime) -> Result<SweepCount, SweepError> {
        let cutoff = now - self.policy.task_retention;
        let expired: Vec<CompilationTask> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|task| task.status.is_terminal() && task.created_at < cutoff)
            .collect();

        let mut count = SweepCount {
            candidates: expired.len(),
            ..SweepCount::default()
        };

        for task in expired {
            match self.store.remove(task.id).await {
                Ok(true) => {
                    count.deleted += 1;
                    self.release_task_files(&task).await;
                }
                Ok(false) => {}
                Err(err) => warn!(
                    target = "texforge::sweeper",
                    op = "sweep_tasks",
                    result = "error",
                    task_id = %task.id,
                    error = %err,
                    "Failed to remove task record"
                ),
            }
        }

        counter!("texforge_sweep_deleted_total", "class" => "tasks")
            .increment(count.deleted as u64);
        Ok(count)
    }

    /// Uploaded source and durable log belong to the record; drop them with it.
    async fn release_task_files(&self, task: &CompilationTask) {
        if let Err(err) = self.sources.delete(&task.source.stored_name).await {
            warn!(
                target = "texforge::sweeper",
                op = "release_task_files",
                result = "error",
                task_id = %task.id,
                error = %err,
                "Failed to delete uploaded source"
            );
        }

        if let Some(log) = task.log_path.as_deref() {
            remove_file_quietly(task, log).await;
        }
    }
}

async fn artifact_modified(path: &Path) -> io::Result<OffsetDateTime> {
    let metadata = fs::metadata(path).await?;
    Ok(OffsetDateTime::from(metadata.modified()?))
}

async fn remove_file_quietly(task: &CompilationTask, path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "texforge::sweeper",
            op = "release_task_files",
            result = "error",
            task_id = %task.id,
            path = %path.display(),
            error = %err,
            "Failed to delete task log"
        ),
    }
}

fn settle(class: &'static str, result: Result<SweepCount, SweepError>) -> SweepCount {
    result.unwrap_or_else(|err| {
        warn!(
            target = "texforge::sweeper",
            op = "sweep",
            result = "error",
            class,
            error = %err,
            "Sweep of resource class failed"
        );
        SweepCount::default()
    })
}

fn format_count(count: SweepCount) -> String {
    format!("{}/{}", count.deleted, count.candidates)
}
