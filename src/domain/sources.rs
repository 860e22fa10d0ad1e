//! Naming rules for uploaded sources and the artifacts derived from them.
//!
//! A stored source name embeds the upload timestamp, a slug of the client
//! file name and the owning task id, e.g.
//! `20240131_101500_thesis_6f1c...e2.zip`. The artifact produced from it keeps
//! the same stem, which lets retention map any artifact back to its task.

use std::path::{Path, PathBuf};

use serde::Serialize;
use slug::slugify;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;
use super::tasks::TaskId;

const FALLBACK_STEM: &str = "document";
const MAIN_DOCUMENT_HINT: &str = "main";

/// Kind of payload a client submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A single `.tex` document.
    Document,
    /// A `.zip` archive holding a document tree.
    Archive,
}

impl SourceKind {
    /// Classify a client file name by its extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Result<Self, DomainError> {
        match extension_lowercase(Path::new(name)).as_deref() {
            Some("tex") => Ok(Self::Document),
            Some("zip") => Ok(Self::Archive),
            Some(_) => Err(DomainError::unsupported_source(
                name,
                "only .tex and .zip uploads are accepted",
            )),
            None => Err(DomainError::unsupported_source(
                name,
                "file name has no extension",
            )),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Document => "tex",
            Self::Archive => "zip",
        }
    }
}

/// An uploaded source persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub stored_name: String,
    pub kind: SourceKind,
}

impl SourceDocument {
    pub fn new(path: PathBuf, stored_name: String, kind: SourceKind) -> Self {
        Self {
            path,
            stored_name,
            kind,
        }
    }

    /// Stored name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.stored_name)
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or(FALLBACK_STEM)
    }
}

/// Slug of the file stem, falling back to `document` when nothing survives.
pub fn sanitize_stem(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    let base = slugify(stem);
    if base.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        base
    }
}

/// Build the on-disk name for an upload admitted at `now` for task `id`.
pub fn stored_source_name(
    original: &str,
    kind: SourceKind,
    id: TaskId,
    now: OffsetDateTime,
) -> String {
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    format!(
        "{year:04}{:02}{day:02}_{hour:02}{minute:02}{second:02}_{}_{id}.{}",
        month as u8,
        sanitize_stem(original),
        kind.extension()
    )
}

/// Recover the owning task id from an artifact (or stored source) file name.
pub fn task_id_from_artifact_name(name: &str) -> Option<TaskId> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let (_, candidate) = stem.rsplit_once('_')?;
    Uuid::parse_str(candidate).ok().map(TaskId::from_uuid)
}

/// Client-facing download name: the original stem with a `.pdf` extension.
pub fn download_file_name(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|value| value.to_str())
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(FALLBACK_STEM);
    format!("{stem}.pdf")
}

pub fn is_document_path(path: &Path) -> bool {
    extension_lowercase(path).as_deref() == Some("tex")
}

pub fn is_diagram_path(path: &Path) -> bool {
    extension_lowercase(path).as_deref() == Some("asy")
}

/// Pick the primary document among archive entries.
///
/// Only `.tex` entries are eligible. Candidates are ordered lexically; the
/// first whose stem contains `main` (any case) wins, otherwise the first
/// eligible entry does.
pub fn select_main_document<I, P>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut documents: Vec<PathBuf> = candidates
        .into_iter()
        .map(|candidate| candidate.as_ref().to_path_buf())
        .filter(|candidate| is_document_path(candidate))
        .collect();
    documents.sort();

    let preferred = documents.iter().position(|candidate| {
        candidate
            .file_stem()
            .and_then(|value| value.to_str())
            .is_some_and(|stem| stem.to_ascii_lowercase().contains(MAIN_DOCUMENT_HINT))
    });

    match preferred {
        Some(index) => Some(documents.swap_remove(index)),
        None => documents.into_iter().next(),
    }
}

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}
