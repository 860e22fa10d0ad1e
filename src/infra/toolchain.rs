//! Toolchain backed by the `pdflatex` and `asy` command-line programs.

use std::{
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::application::toolchain::{ToolRun, Toolchain, ToolchainError};
use crate::config::CompilerSettings;

#[derive(Debug, Clone)]
pub struct CliToolchain {
    latex_cli_path: PathBuf,
    diagram_cli_path: PathBuf,
    shell_escape: bool,
}

impl CliToolchain {
    pub fn new(latex_cli_path: PathBuf, diagram_cli_path: PathBuf, shell_escape: bool) -> Self {
        Self {
            latex_cli_path,
            diagram_cli_path,
            shell_escape,
        }
    }

    async fn run(
        &self,
        program: &Path,
        args: Vec<&OsStr>,
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError> {
        let started_at = Instant::now();
        let output = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                warn!(
                    target = "texforge::toolchain",
                    op = "toolchain::run",
                    result = "error",
                    program = %program.display(),
                    error_code = "spawn_cli",
                    error = %err,
                    "Failed to spawn compiler"
                );
                if err.kind() == ErrorKind::NotFound {
                    ToolchainError::NotFound {
                        program: program.to_path_buf(),
                        source: err,
                    }
                } else {
                    ToolchainError::Io {
                        program: program.to_path_buf(),
                        source: err,
                    }
                }
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let result = if output.status.success() {
            "ok"
        } else {
            "nonzero_exit"
        };
        debug!(
            target = "texforge::toolchain",
            op = "toolchain::run",
            result,
            program = %program.display(),
            exit_code = output.status.code().map(i64::from).unwrap_or(-1),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Compiler invocation finished"
        );

        if output.status.success() {
            Ok(ToolRun::succeeded(combined))
        } else {
            Ok(ToolRun::failed(output.status.code(), combined))
        }
    }
}

impl From<&CompilerSettings> for CliToolchain {
    fn from(settings: &CompilerSettings) -> Self {
        Self::new(
            settings.latex_cli_path.clone(),
            settings.diagram_cli_path.clone(),
            settings.shell_escape,
        )
    }
}

#[async_trait]
impl Toolchain for CliToolchain {
    async fn compile(
        &self,
        main_document: &Path,
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError> {
        let mut args = vec![OsStr::new("-interaction=nonstopmode")];
        if self.shell_escape {
            args.push(OsStr::new("-shell-escape"));
        }
        args.push(main_document.as_os_str());
        self.run(&self.latex_cli_path, args, working_dir).await
    }

    async fn compile_diagrams(
        &self,
        files: &[PathBuf],
        working_dir: &Path,
    ) -> Result<ToolRun, ToolchainError> {
        let args = files.iter().map(|file| file.as_os_str()).collect();
        self.run(&self.diagram_cli_path, args, working_dir).await
    }
}
