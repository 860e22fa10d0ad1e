//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CliArgs, Command, CompilerOverrides, LoggingOverrides, ServeArgs, ServeOverrides, StorageOverrides,
    SweepArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "texforge";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPLOADS_DIR: &str = "storage/uploads";
const DEFAULT_ARTIFACTS_DIR: &str = "storage/pdfs";
const DEFAULT_LOGS_DIR: &str = "storage/logs";
pub const DEFAULT_SCRATCH_PREFIX: &str = "tex_compile_";
const DEFAULT_LATEX_CLI_PATH: &str = "pdflatex";
const DEFAULT_DIAGRAM_CLI_PATH: &str = "asy";
const DEFAULT_CLEANUP_ATTEMPTS: u64 = 3;
const DEFAULT_CLEANUP_BACKOFF_MS: u64 = 500;
const DEFAULT_CLEANUP_SETTLE_MS: u64 = 1_000;
const DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES: u64 = 20 * 1024 * 1024;
const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_RETENTION_STARTUP_DELAY_SECS: u64 = 10;
const DEFAULT_SCRATCH_RETENTION_MINUTES: u64 = 15;
const DEFAULT_ARTIFACT_RETENTION_MINUTES: u64 = 60;
const DEFAULT_TASK_RETENTION_MINUTES: u64 = 120;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub compiler: CompilerSettings,
    pub uploads: UploadSettings,
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub uploads_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub scratch_root: PathBuf,
    pub scratch_prefix: String,
}

#[derive(Debug, Clone)]
pub struct CompilerSettings {
    pub latex_cli_path: PathBuf,
    pub diagram_cli_path: PathBuf,
    pub shell_escape: bool,
    pub cleanup_attempts: NonZeroU32,
    pub cleanup_backoff: Duration,
    pub cleanup_settle_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_request_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub interval: Duration,
    pub startup_delay: Duration,
    pub scratch_retention: Duration,
    pub artifact_retention: Duration,
    pub task_retention: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TEXFORGE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => {
            raw.apply_storage_overrides(&args.storage);
            raw.apply_logging_overrides(&args.logging);
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    storage: RawStorageSettings,
    compiler: RawCompilerSettings,
    uploads: RawUploadSettings,
    retention: RawRetentionSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(limit) = overrides.uploads_max_request_bytes {
            self.uploads.max_request_bytes = Some(limit);
        }
        if let Some(seconds) = overrides.retention_interval_seconds {
            self.retention.interval_seconds = Some(seconds);
        }

        self.apply_storage_overrides(&overrides.storage);
        self.apply_compiler_overrides(&overrides.compiler);
        self.apply_logging_overrides(&overrides.logging);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(dir) = overrides.uploads_dir.as_ref() {
            self.storage.uploads_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.artifacts_dir.as_ref() {
            self.storage.artifacts_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.logs_dir.as_ref() {
            self.storage.logs_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.scratch_root.as_ref() {
            self.storage.scratch_root = Some(dir.clone());
        }
    }

    fn apply_compiler_overrides(&mut self, overrides: &CompilerOverrides) {
        if let Some(path) = overrides.latex_cli_path.as_ref() {
            self.compiler.latex_cli_path = Some(path.clone());
        }
        if let Some(path) = overrides.diagram_cli_path.as_ref() {
            self.compiler.diagram_cli_path = Some(path.clone());
        }
        if let Some(enabled) = overrides.shell_escape {
            self.compiler.shell_escape = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            storage,
            compiler,
            uploads,
            retention,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            storage: build_storage_settings(storage)?,
            compiler: build_compiler_settings(compiler)?,
            uploads: build_upload_settings(uploads)?,
            retention: build_retention_settings(retention)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = non_zero_duration(
        graceful_secs,
        Duration::from_secs,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let scratch_prefix = storage
        .scratch_prefix
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_SCRATCH_PREFIX.to_string());
    if scratch_prefix.is_empty() {
        return Err(LoadError::invalid(
            "storage.scratch_prefix",
            "prefix must not be empty",
        ));
    }
    if scratch_prefix.contains(['/', '\\']) {
        return Err(LoadError::invalid(
            "storage.scratch_prefix",
            "prefix must not contain path separators",
        ));
    }

    Ok(StorageSettings {
        uploads_dir: storage
            .uploads_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOADS_DIR)),
        artifacts_dir: storage
            .artifacts_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
        logs_dir: storage
            .logs_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGS_DIR)),
        scratch_root: storage.scratch_root.unwrap_or_else(std::env::temp_dir),
        scratch_prefix,
    })
}

fn build_compiler_settings(compiler: RawCompilerSettings) -> Result<CompilerSettings, LoadError> {
    let cleanup_attempts = non_zero_u32(
        compiler.cleanup_attempts.unwrap_or(DEFAULT_CLEANUP_ATTEMPTS),
        "compiler.cleanup_attempts",
    )?;
    let cleanup_backoff = non_zero_duration(
        compiler
            .cleanup_backoff_ms
            .unwrap_or(DEFAULT_CLEANUP_BACKOFF_MS),
        Duration::from_millis,
        "compiler.cleanup_backoff_ms",
    )?;
    let cleanup_settle_delay = Duration::from_millis(
        compiler
            .cleanup_settle_ms
            .unwrap_or(DEFAULT_CLEANUP_SETTLE_MS),
    );

    Ok(CompilerSettings {
        latex_cli_path: compiler
            .latex_cli_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LATEX_CLI_PATH)),
        diagram_cli_path: compiler
            .diagram_cli_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIAGRAM_CLI_PATH)),
        shell_escape: compiler.shell_escape.unwrap_or(true),
        cleanup_attempts,
        cleanup_backoff,
        cleanup_settle_delay,
    })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let max_request_bytes_value = uploads
        .max_request_bytes
        .unwrap_or(DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes_value).ok_or_else(|| {
        LoadError::invalid("uploads.max_request_bytes", "must be greater than zero")
    })?;
    usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "uploads.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(UploadSettings { max_request_bytes })
}

fn build_retention_settings(
    retention: RawRetentionSettings,
) -> Result<RetentionSettings, LoadError> {
    let minutes = |value: u64| Duration::from_secs(value.saturating_mul(60));

    Ok(RetentionSettings {
        interval: non_zero_duration(
            retention
                .interval_seconds
                .unwrap_or(DEFAULT_RETENTION_INTERVAL_SECS),
            Duration::from_secs,
            "retention.interval_seconds",
        )?,
        startup_delay: Duration::from_secs(
            retention
                .startup_delay_seconds
                .unwrap_or(DEFAULT_RETENTION_STARTUP_DELAY_SECS),
        ),
        scratch_retention: non_zero_duration(
            retention
                .scratch_minutes
                .unwrap_or(DEFAULT_SCRATCH_RETENTION_MINUTES),
            minutes,
            "retention.scratch_minutes",
        )?,
        artifact_retention: non_zero_duration(
            retention
                .artifact_minutes
                .unwrap_or(DEFAULT_ARTIFACT_RETENTION_MINUTES),
            minutes,
            "retention.artifact_minutes",
        )?,
        task_retention: non_zero_duration(
            retention
                .task_minutes
                .unwrap_or(DEFAULT_TASK_RETENTION_MINUTES),
            minutes,
            "retention.task_minutes",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    uploads_dir: Option<PathBuf>,
    artifacts_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
    scratch_root: Option<PathBuf>,
    scratch_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompilerSettings {
    latex_cli_path: Option<PathBuf>,
    diagram_cli_path: Option<PathBuf>,
    shell_escape: Option<bool>,
    cleanup_attempts: Option<u64>,
    cleanup_backoff_ms: Option<u64>,
    cleanup_settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetentionSettings {
    interval_seconds: Option<u64>,
    startup_delay_seconds: Option<u64>,
    scratch_minutes: Option<u64>,
    artifact_minutes: Option<u64>,
    task_minutes: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_duration(
    value: u64,
    unit: impl Fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

#[cfg(test)]
mod tests;
