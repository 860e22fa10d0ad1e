use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the texforge binary.
#[derive(Debug, Parser)]
#[command(name = "texforge", version, about = "LaTeX compilation service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TEXFORGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service, compilation queue and retention sweeper.
    Serve(Box<ServeArgs>),
    /// Run a single retention sweep over the configured directories and exit.
    Sweep(SweepArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the directory uploaded sources are written to.
    #[arg(long = "storage-uploads-dir", value_name = "PATH")]
    pub uploads_dir: Option<PathBuf>,

    /// Override the directory compiled PDFs are kept in.
    #[arg(long = "storage-artifacts-dir", value_name = "PATH")]
    pub artifacts_dir: Option<PathBuf>,

    /// Override the directory compiler logs are kept in.
    #[arg(long = "storage-logs-dir", value_name = "PATH")]
    pub logs_dir: Option<PathBuf>,

    /// Override the parent directory of per-compilation scratch directories.
    #[arg(long = "storage-scratch-root", value_name = "PATH")]
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CompilerOverrides {
    /// Override the LaTeX compiler executable.
    #[arg(long = "compiler-latex-cli-path", value_name = "PATH")]
    pub latex_cli_path: Option<PathBuf>,

    /// Override the diagram compiler executable.
    #[arg(long = "compiler-diagram-cli-path", value_name = "PATH")]
    pub diagram_cli_path: Option<PathBuf>,

    /// Allow documents to run shell commands during compilation.
    #[arg(
        long = "compiler-shell-escape",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub shell_escape: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub compiler: CompilerOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the maximum upload request size in bytes.
    #[arg(long = "uploads-max-request-bytes", value_name = "BYTES")]
    pub uploads_max_request_bytes: Option<u64>,

    /// Override the retention sweep cadence.
    #[arg(long = "retention-interval-seconds", value_name = "SECONDS")]
    pub retention_interval_seconds: Option<u64>,
}
