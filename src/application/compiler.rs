//! Multi-pass document compilation inside an isolated scratch directory.
//!
//! The executor never returns an error: every problem that can be attributed
//! to the task (no document, compiler exit, missing PDF, I/O) is folded into a
//! [`CompilationOutcome::Failed`]. The scratch directory is released on every
//! path, including a panic inside the pass sequence, which is re-raised after
//! cleanup so the dispatcher can record it.

use std::{
    io,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{fs, task::JoinError};
use tracing::{info, warn};

use crate::domain::sources::{SourceKind, is_diagram_path, select_main_document};
use crate::domain::tasks::{CompilationOutcome, CompilationTask, FailureKind};
use crate::infra::scratch::ScratchSpace;

use super::toolchain::{ToolRun, Toolchain, ToolchainError};

const NO_DOCUMENT_MESSAGE: &str = "No compilable document found in archive";
const MISSING_ARTIFACT_MESSAGE: &str = "PDF artifact was not generated";
const LATEX_PASSES: [u8; 3] = [1, 2, 3];

/// Seam between the dispatcher and whatever turns a task into an outcome.
#[async_trait]
pub trait DocumentCompiler: Send + Sync {
    async fn compile(&self, task: &CompilationTask) -> CompilationOutcome;
}

#[derive(Debug, Error)]
enum ArchiveError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive is unreadable: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive worker failed: {0}")]
    Join(#[from] JoinError),
}

/// Where the main document comes from.
enum SourcePlan {
    Document,
    Archive { main: PathBuf },
}

type PassFailure = (FailureKind, String);

pub struct CompilationExecutor {
    toolchain: Arc<dyn Toolchain>,
    scratch: ScratchSpace,
    artifacts_dir: PathBuf,
    logs_dir: PathBuf,
}

impl CompilationExecutor {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        scratch: ScratchSpace,
        artifacts_dir: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            toolchain,
            scratch,
            artifacts_dir,
            logs_dir,
        }
    }

    async fn execute(&self, task: &CompilationTask) -> CompilationOutcome {
        let plan = match task.source.kind {
            SourceKind::Document => SourcePlan::Document,
            SourceKind::Archive => match inspect_archive(task.source.path.clone()).await {
                Ok(Some(main)) => SourcePlan::Archive { main },
                Ok(None) => {
                    return CompilationOutcome::failed(
                        FailureKind::NoDocument,
                        NO_DOCUMENT_MESSAGE,
                        None,
                    );
                }
                Err(err) => {
                    return CompilationOutcome::failed(
                        FailureKind::Io,
                        format!("Failed to read archive: {err}"),
                        None,
                    );
                }
            },
        };

        let scratch_dir = match self.scratch.create().await {
            Ok(dir) => dir,
            Err(err) => {
                return CompilationOutcome::failed(
                    FailureKind::Io,
                    format!("Failed to create scratch directory: {err}"),
                    None,
                );
            }
        };

        let result = AssertUnwindSafe(self.compile_in(task, plan, &scratch_dir))
            .catch_unwind()
            .await;
        self.scratch.release(&scratch_dir).await;

        match result {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn compile_in(
        &self,
        task: &CompilationTask,
        plan: SourcePlan,
        scratch_dir: &Path,
    ) -> CompilationOutcome {
        let main_document = match self.stage_source(task, plan, scratch_dir).await {
            Ok(path) => path,
            Err(message) => return CompilationOutcome::failed(FailureKind::Io, message, None),
        };

        let working_dir = main_document
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| scratch_dir.to_path_buf());
        let (Some(file_name), Some(stem)) = (
            main_document.file_name().map(PathBuf::from),
            main_document
                .file_stem()
                .and_then(|value| value.to_str())
                .map(str::to_owned),
        ) else {
            return CompilationOutcome::failed(
                FailureKind::NoDocument,
                NO_DOCUMENT_MESSAGE,
                None,
            );
        };

        let passes = self.run_passes(task, &working_dir, &file_name, &stem).await;
        let log = self
            .persist_log(task, &working_dir.join(format!("{stem}.log")))
            .await;

        match passes {
            Ok(pdf) => match self.persist_artifact(task, &pdf).await {
                Ok(artifact) => CompilationOutcome::Succeeded { artifact, log },
                Err(err) => CompilationOutcome::failed(
                    FailureKind::Io,
                    format!("Failed to store PDF artifact: {err}"),
                    log,
                ),
            },
            Err((kind, message)) => CompilationOutcome::failed(kind, message, log),
        }
    }

    /// Place the source inside the scratch directory and return the main
    /// document's path there.
    async fn stage_source(
        &self,
        task: &CompilationTask,
        plan: SourcePlan,
        scratch_dir: &Path,
    ) -> Result<PathBuf, String> {
        match plan {
            SourcePlan::Document => {
                let target = scratch_dir.join(&task.source.stored_name);
                fs::copy(&task.source.path, &target)
                    .await
                    .map_err(|err| format!("Failed to stage source document: {err}"))?;
                Ok(target)
            }
            SourcePlan::Archive { main } => {
                let extracted =
                    extract_archive(task.source.path.clone(), scratch_dir.to_path_buf())
                        .await
                        .map_err(|err| format!("Failed to extract archive: {err}"))?;
                info!(
                    target = "texforge::compiler",
                    op = "stage_source",
                    task_id = %task.id,
                    entries = extracted,
                    main_document = %main.display(),
                    "Archive extracted"
                );
                Ok(scratch_dir.join(main))
            }
        }
    }

    async fn run_passes(
        &self,
        task: &CompilationTask,
        working_dir: &Path,
        file_name: &Path,
        stem: &str,
    ) -> Result<PathBuf, PassFailure> {
        for pass in LATEX_PASSES {
            let run = self.toolchain.compile(file_name, working_dir).await;
            check_pass(task, pass, run)?;

            if pass == 1 {
                self.compile_diagrams(task, working_dir).await;
            }
        }

        let pdf = working_dir.join(format!("{stem}.pdf"));
        match fs::metadata(&pdf).await {
            Ok(metadata) if metadata.is_file() => Ok(pdf),
            _ => Err((FailureKind::MissingArtifact, MISSING_ARTIFACT_MESSAGE.to_string())),
        }
    }

    /// Best-effort batch compile of every diagram source next to the main
    /// document. Failures are logged and otherwise ignored.
    async fn compile_diagrams(&self, task: &CompilationTask, working_dir: &Path) {
        let diagrams = match list_diagrams(working_dir).await {
            Ok(diagrams) if diagrams.is_empty() => return,
            Ok(diagrams) => diagrams,
            Err(err) => {
                warn!(
                    target = "texforge::compiler",
                    op = "compile_diagrams",
                    result = "error",
                    task_id = %task.id,
                    error = %err,
                    "Could not list diagram sources"
                );
                return;
            }
        };

        match self.toolchain.compile_diagrams(&diagrams, working_dir).await {
            Ok(run) if run.success => {}
            Ok(run) => warn!(
                target = "texforge::compiler",
                op = "compile_diagrams",
                result = "nonzero_exit",
                task_id = %task.id,
                files = diagrams.len(),
                exit_code = run.exit_code.map(i64::from).unwrap_or(-1),
                output = %tail(&run.output),
                "Diagram compilation failed; continuing without it"
            ),
            Err(err) => warn!(
                target = "texforge::compiler",
                op = "compile_diagrams",
                result = "error",
                task_id = %task.id,
                files = diagrams.len(),
                error = %err,
                "Diagram compiler unavailable; continuing without it"
            ),
        }
    }

    async fn persist_artifact(&self, task: &CompilationTask, pdf: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.artifacts_dir).await?;
        let target = self.artifacts_dir.join(task.artifact_file_name());
        fs::copy(pdf, &target).await?;
        Ok(target)
    }

    /// Copy the compiler log to `<logs_dir>/<task id>.log` when one exists.
    async fn persist_log(&self, task: &CompilationTask, log: &Path) -> Option<PathBuf> {
        if !fs::try_exists(log).await.unwrap_or(false) {
            return None;
        }

        let target = self.logs_dir.join(format!("{}.log", task.id));
        let copied = async {
            fs::create_dir_all(&self.logs_dir).await?;
            fs::copy(log, &target).await
        }
        .await;

        match copied {
            Ok(_) => Some(target),
            Err(err) => {
                warn!(
                    target = "texforge::compiler",
                    op = "persist_log",
                    result = "error",
                    task_id = %task.id,
                    error = %err,
                    "Failed to keep compiler log"
                );
                None
            }
        }
    }
}

#[async_trait]
impl DocumentCompiler for CompilationExecutor {
    async fn compile(&self, task: &CompilationTask) -> CompilationOutcome {
        let started_at = Instant::now();
        let outcome = self.execute(task).await;
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        counter!("texforge_compile_total", "outcome" => outcome.label()).increment(1);
        histogram!("texforge_compile_ms").record(elapsed_ms as f64);

        match &outcome {
            CompilationOutcome::Succeeded { artifact, .. } => info!(
                target = "texforge::compiler",
                op = "compile",
                result = "ok",
                task_id = %task.id,
                elapsed_ms,
                artifact = %artifact.display(),
                "Compilation succeeded"
            ),
            CompilationOutcome::Failed { kind, message, log } => warn!(
                target = "texforge::compiler",
                op = "compile",
                result = "error",
                task_id = %task.id,
                elapsed_ms,
                error_code = kind.as_str(),
                error = %message,
                has_log = log.is_some(),
                "Compilation failed"
            ),
        }

        outcome
    }
}

fn check_pass(
    task: &CompilationTask,
    pass: u8,
    run: Result<ToolRun, ToolchainError>,
) -> Result<(), PassFailure> {
    match run {
        Ok(run) if run.success => Ok(()),
        Ok(run) => {
            warn!(
                target = "texforge::compiler",
                op = "latex_pass",
                result = "nonzero_exit",
                task_id = %task.id,
                pass,
                exit_code = run.exit_code.map(i64::from).unwrap_or(-1),
                output = %tail(&run.output),
                "LaTeX pass failed"
            );
            let exit = run
                .exit_code
                .map(|code| format!("exit code {code}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            Err((
                FailureKind::CompilerExit,
                format!("LaTeX compilation failed on pass {pass} ({exit})"),
            ))
        }
        Err(err) => Err((FailureKind::Toolchain, err.to_string())),
    }
}

async fn list_diagrams(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut diagrams = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = PathBuf::from(entry.file_name());
        if is_diagram_path(&name) && entry.file_type().await?.is_file() {
            diagrams.push(name);
        }
    }
    diagrams.sort();
    Ok(diagrams)
}

/// Choose the main document from archive entries without extracting anything.
async fn inspect_archive(path: PathBuf) -> Result<Option<PathBuf>, ArchiveError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut candidates = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            if let Some(name) = entry.enclosed_name() {
                candidates.push(name);
            }
        }
        Ok::<_, ArchiveError>(select_main_document(candidates))
    })
    .await?
}

/// Unpack every safely-named entry under `dest`, returning the file count.
/// Entries whose names would escape `dest` are skipped.
async fn extract_archive(path: PathBuf, dest: PathBuf) -> Result<usize, ArchiveError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut extracted = 0;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                continue;
            };
            let target = dest.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            extracted += 1;
        }
        Ok::<_, ArchiveError>(extracted)
    })
    .await?
}

fn tail(output: &str) -> &str {
    const LIMIT: usize = 2048;
    if output.len() <= LIMIT {
        return output;
    }
    let mut start = output.len() - LIMIT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
