//! Per-compilation scratch directories under a shared root.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashSet;
use metrics::counter;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CompilerSettings;

/// Removes a directory tree. Swappable so tests can simulate held handles.
#[async_trait]
pub trait DirectoryRemover: Send + Sync {
    async fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsRemover;

#[async_trait]
impl DirectoryRemover for FsRemover {
    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path).await
    }
}

/// Bounded-retry removal parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub attempts: u32,
    /// Base delay; attempt `n` waits `backoff * n` before retrying.
    pub backoff: Duration,
    /// Pause before the first attempt after a compilation so child processes
    /// can release their handles.
    pub settle_delay: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl From<&CompilerSettings> for CleanupPolicy {
    fn from(settings: &CompilerSettings) -> Self {
        Self {
            attempts: settings.cleanup_attempts.get(),
            backoff: settings.cleanup_backoff,
            settle_delay: settings.cleanup_settle_delay,
        }
    }
}

#[derive(Clone)]
pub struct ScratchSpace {
    root: PathBuf,
    prefix: String,
    policy: CleanupPolicy,
    remover: Arc<dyn DirectoryRemover>,
    /// Directories handed out by `create` and not yet released. Shared by
    /// every clone, so the sweeper sees the executor's live compilations.
    live: Arc<DashSet<PathBuf>>,
}

impl std::fmt::Debug for ScratchSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchSpace")
            .field("root", &self.root)
            .field("prefix", &self.prefix)
            .field("policy", &self.policy)
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl ScratchSpace {
    pub fn new(root: PathBuf, prefix: impl Into<String>, policy: CleanupPolicy) -> Self {
        Self {
            root,
            prefix: prefix.into(),
            policy,
            remover: Arc::new(FsRemover),
            live: Arc::new(DashSet::new()),
        }
    }

    pub fn with_remover(mut self, remover: Arc<dyn DirectoryRemover>) -> Self {
        self.remover = remover;
        self
    }

    /// Create a fresh `<root>/<prefix><uuid>` directory. A name collision is an
    /// error.
    pub async fn create(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let path = self
            .root
            .join(format!("{}{}", self.prefix, Uuid::new_v4().simple()));
        fs::create_dir(&path).await?;
        self.live.insert(path.clone());
        Ok(path)
    }

    /// Remove a directory after a compilation, waiting for the settle delay first.
    ///
    /// The directory stops counting as live either way; a leaked one is left
    /// to the retention sweep.
    pub async fn release(&self, path: &Path) -> bool {
        if !self.policy.settle_delay.is_zero() {
            tokio::time::sleep(self.policy.settle_delay).await;
        }
        let removed = self.remove_with_retry(path).await;
        self.live.remove(path);
        removed
    }

    /// Remove a directory tree with bounded retries. Returns whether the
    /// directory is gone. Exhausting every attempt is logged, never raised.
    pub async fn remove_with_retry(&self, path: &Path) -> bool {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.remover.remove_dir_all(path).await {
                Ok(()) => {
                    debug!(
                        target = "texforge::scratch",
                        op = "remove_with_retry",
                        result = "removed",
                        attempt,
                        path = %path.display(),
                        "Scratch directory removed"
                    );
                    return true;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return true,
                Err(err) => {
                    debug!(
                        target = "texforge::scratch",
                        op = "remove_with_retry",
                        result = "retry",
                        attempt,
                        path = %path.display(),
                        error = %err,
                        "Scratch directory removal failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }

        counter!("texforge_scratch_leaked_total").increment(1);
        warn!(
            target = "texforge::scratch",
            op = "remove_with_retry",
            result = "leaked",
            attempts,
            path = %path.display(),
            error = %last_error.map(|err| err.to_string()).unwrap_or_default(),
            "Giving up on scratch directory removal"
        );
        false
    }

    /// Prefix-matching directories last modified before `cutoff`.
    pub async fn list_expired(&self, cutoff: OffsetDateTime) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut expired = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_candidate = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&self.prefix));
            if !is_candidate {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    debug!(
                        target = "texforge::scratch",
                        op = "list_expired",
                        result = "skipped",
                        path = %entry.path().display(),
                        error = %err,
                        "Could not stat scratch candidate"
                    );
                    continue;
                }
            };

            let modified = match metadata.modified() {
                Ok(modified) => OffsetDateTime::from(modified),
                Err(_) => continue,
            };
            if modified < cutoff {
                expired.push(entry.path());
            }
        }

        expired.sort();
        Ok(expired)
    }

    /// Live compilations own their directory. Anything else whose contents
    /// cannot be listed is treated as held by a running process.
    pub async fn is_in_use(&self, path: &Path) -> bool {
        self.live.contains(path) || fs::read_dir(path).await.is_err()
    }
}
