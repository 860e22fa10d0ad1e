use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Captured result of one external compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ToolRun {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            output: output.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("compiler `{program}` is not installed or not on PATH")]
    NotFound {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run compiler `{program}`: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// External compiler capability used by the executor.
///
/// Both operations run non-interactively inside `working_dir`. A nonzero exit
/// is reported through [`ToolRun::success`]; `Err` is reserved for failures to
/// launch the process at all.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn compile(
        &self,
        main_document: &Path,
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError>;

    /// Compile every diagram source in one invocation.
    async fn compile_diagrams(
        &self,
        files: &[PathBuf],
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError>;
}
