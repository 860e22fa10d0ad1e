use std::{process, sync::Arc};

use texforge::{
    application::{
        compiler::{CompilationExecutor, DocumentCompiler},
        dispatcher::QueueDispatcher,
        error::AppError,
        service::CompilationService,
        store::{InMemoryTaskStore, TaskStore},
        sweeper::{RetentionPolicy, RetentionSweeper},
    },
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        scratch::{CleanupPolicy, ScratchSpace},
        telemetry,
        toolchain::CliToolchain,
        uploads::SourceStorage,
    },
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
    }
}

struct Runtime {
    store: Arc<dyn TaskStore>,
    scratch: ScratchSpace,
    sources: Arc<SourceStorage>,
}

fn build_runtime(settings: &config::Settings) -> Result<Runtime, AppError> {
    let sources =
        SourceStorage::new(settings.storage.uploads_dir.clone()).map_err(InfraError::from)?;
    let scratch = ScratchSpace::new(
        settings.storage.scratch_root.clone(),
        settings.storage.scratch_prefix.clone(),
        CleanupPolicy::from(&settings.compiler),
    );

    Ok(Runtime {
        store: Arc::new(InMemoryTaskStore::new()),
        scratch,
        sources: Arc::new(sources),
    })
}

fn build_sweeper(runtime: &Runtime, settings: &config::Settings) -> RetentionSweeper {
    RetentionSweeper::new(
        runtime.store.clone(),
        runtime.scratch.clone(),
        runtime.sources.clone(),
        settings.storage.artifacts_dir.clone(),
        RetentionPolicy::from(&settings.retention),
    )
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_runtime(&settings)?;

    let compiler: Arc<dyn DocumentCompiler> = Arc::new(CompilationExecutor::new(
        Arc::new(CliToolchain::from(&settings.compiler)),
        runtime.scratch.clone(),
        settings.storage.artifacts_dir.clone(),
        settings.storage.logs_dir.clone(),
    ));
    let dispatcher = QueueDispatcher::new(runtime.store.clone(), compiler);
    let service = Arc::new(CompilationService::new(
        runtime.store.clone(),
        dispatcher.clone(),
        runtime.sources.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(build_sweeper(&runtime, &settings)).spawn(shutdown_rx);

    let router = http::build_router(HttpState {
        service,
        upload_limit_bytes: settings.uploads.max_request_bytes.get(),
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|source| InfraError::Bind {
            addr: settings.server.addr,
            source,
        })?;

    info!(
        target = "texforge::serve",
        op = "listen",
        result = "ok",
        addr = %settings.server.addr,
        latex = %settings.compiler.latex_cli_path.display(),
        scratch_root = %settings.storage.scratch_root.display(),
        "Compilation service listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::Server)?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = sweeper.await {
        warn!(
            target = "texforge::serve",
            op = "shutdown",
            result = "error",
            error = %err,
            "Retention sweeper ended abnormally"
        );
    }

    let grace = settings.server.graceful_shutdown;
    match tokio::time::timeout(grace, dispatcher.wait_idle()).await {
        Ok(()) => info!(
            target = "texforge::serve",
            op = "shutdown",
            result = "ok",
            "Compilation queue drained"
        ),
        Err(_) => warn!(
            target = "texforge::serve",
            op = "shutdown",
            result = "timeout",
            grace_secs = grace.as_secs(),
            "Compilation queue still busy at shutdown"
        ),
    }

    Ok(())
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_runtime(&settings)?;
    let report = build_sweeper(&runtime, &settings)
        .sweep_at(OffsetDateTime::now_utc())
        .await;

    info!(
        target = "texforge::sweep",
        op = "sweep",
        result = "ok",
        scratch_deleted = report.scratch.deleted,
        artifacts_deleted = report.artifacts.deleted,
        "One-shot retention sweep complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "texforge::serve",
            op = "shutdown",
            result = "error",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(
        target = "texforge::serve",
        op = "shutdown",
        result = "signal",
        "Shutdown signal received"
    );
}
