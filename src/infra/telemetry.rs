use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and register metric descriptions.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::Telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "texforge_tasks_submitted_total",
            Unit::Count,
            "Total number of compilation tasks admitted to the queue."
        );
        describe_gauge!(
            "texforge_queue_depth",
            Unit::Count,
            "Tasks admitted but not yet picked up by the drain loop."
        );
        describe_counter!(
            "texforge_compile_total",
            Unit::Count,
            "Compilation attempts by outcome."
        );
        describe_histogram!(
            "texforge_compile_ms",
            Unit::Milliseconds,
            "Wall time of one compilation including scratch cleanup."
        );
        describe_histogram!(
            "texforge_task_ms",
            Unit::Milliseconds,
            "Time from dequeue to the task reaching a terminal status."
        );
        describe_counter!(
            "texforge_scratch_leaked_total",
            Unit::Count,
            "Scratch directories left behind after exhausting removal retries."
        );
        describe_counter!(
            "texforge_sweep_deleted_total",
            Unit::Count,
            "Resources reclaimed by the retention sweeper, by class."
        );
    });
}
