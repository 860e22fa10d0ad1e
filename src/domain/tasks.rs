//! Compilation task records and their lifecycle.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::error::DomainError;
use super::sources::{SourceDocument, download_file_name};

/// Opaque, unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Classification of a failed compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source held no compilable document.
    NoDocument,
    /// A compiler pass exited unsuccessfully.
    CompilerExit,
    /// The compiler reported success but produced no PDF.
    MissingArtifact,
    /// The compiler could not be started.
    Toolchain,
    /// Preparing inputs or persisting outputs failed.
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoDocument => "no_document",
            FailureKind::CompilerExit => "compiler_exit",
            FailureKind::MissingArtifact => "missing_artifact",
            FailureKind::Toolchain => "toolchain",
            FailureKind::Io => "io",
        }
    }
}

/// Result of one compilation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationOutcome {
    Succeeded {
        artifact: PathBuf,
        log: Option<PathBuf>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        log: Option<PathBuf>,
    },
}

impl CompilationOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>, log: Option<PathBuf>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
            log,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Metric/log label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { kind, .. } => kind.as_str(),
        }
    }

    pub fn log(&self) -> Option<&PathBuf> {
        match self {
            Self::Succeeded { log, .. } | Self::Failed { log, .. } => log.as_ref(),
        }
    }
}

/// Snapshot of a compilation task.
///
/// Snapshots are values: lifecycle methods return a new snapshot and leave the
/// receiver untouched, so readers holding an older copy never observe a
/// half-applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationTask {
    pub id: TaskId,
    pub original_name: String,
    pub source: SourceDocument,
    pub status: TaskStatus,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub artifact_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl CompilationTask {
    /// A freshly admitted task.
    pub fn queued(
        id: TaskId,
        original_name: impl Into<String>,
        source: SourceDocument,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            original_name: original_name.into(),
            source,
            status: TaskStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            artifact_path: None,
            log_path: None,
            error_message: None,
        }
    }

    /// Queued → Processing.
    pub fn start(&self, now: OffsetDateTime) -> Result<Self, DomainError> {
        if self.status != TaskStatus::Queued {
            return Err(DomainError::invalid_transition(self.status.as_str(), "start"));
        }

        Ok(Self {
            status: TaskStatus::Processing,
            started_at: Some(now),
            ..self.clone()
        })
    }

    /// Processing → Completed or Failed, depending on the outcome.
    pub fn finish(
        &self,
        outcome: &CompilationOutcome,
        now: OffsetDateTime,
    ) -> Result<Self, DomainError> {
        if self.status != TaskStatus::Processing {
            return Err(DomainError::invalid_transition(self.status.as_str(), "finish"));
        }

        let next = match outcome {
            CompilationOutcome::Succeeded { artifact, log } => Self {
                status: TaskStatus::Completed,
                completed_at: Some(now),
                artifact_path: Some(artifact.clone()),
                log_path: log.clone(),
                error_message: None,
                ..self.clone()
            },
            CompilationOutcome::Failed { message, log, .. } => Self {
                status: TaskStatus::Failed,
                completed_at: Some(now),
                artifact_path: None,
                log_path: log.clone(),
                error_message: Some(message.clone()),
                ..self.clone()
            },
        };

        Ok(next)
    }

    /// Any non-terminal status → Failed, for faults outside the compiler's own
    /// error handling.
    pub fn fail_internal(
        &self,
        message: impl fmt::Display,
        now: OffsetDateTime,
    ) -> Result<Self, DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(self.status.as_str(), "fail"));
        }

        Ok(Self {
            status: TaskStatus::Failed,
            completed_at: Some(now),
            artifact_path: None,
            error_message: Some(format!("Internal error: {message}")),
            ..self.clone()
        })
    }

    /// `completed - started`, or `now - started` while running.
    pub fn duration(&self, now: OffsetDateTime) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some(end - started)
    }

    pub fn duration_ms(&self, now: OffsetDateTime) -> Option<i64> {
        self.duration(now)
            .map(|duration| i64::try_from(duration.whole_milliseconds()).unwrap_or(i64::MAX))
    }

    /// Durable artifact name: the stored source stem with a `.pdf` extension.
    pub fn artifact_file_name(&self) -> String {
        format!("{}.pdf", self.source.stem())
    }

    pub fn download_file_name(&self) -> String {
        download_file_name(&self.original_name)
    }
}
