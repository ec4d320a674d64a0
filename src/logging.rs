//! # Structured Logging
//!
//! Console logging through `tracing-subscriber`, meant for containerized
//! processes whose stdout/stderr is collected externally.
//!
//! - Filter: `RUST_LOG` when set, otherwise `AGENTBUS_LOG_LEVEL`, otherwise a
//!   level derived from `AGENTBUS_ENV` (`debug` in development, `warn` in test,
//!   `info` elsewhere)
//! - Format: human-readable, or JSON when `AGENTBUS_LOG_FORMAT=json`
//! - ANSI colors only when stderr is a terminal

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// A subscriber installed earlier (for example by a test harness or host
/// application) is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let use_ansi = std::io::stderr().is_terminal();

        let layer = if json_output() {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_writer(std::io::stderr)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
            return;
        }

        info!(
            environment = %environment,
            pid = std::process::id(),
            json = json_output(),
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("AGENTBUS_ENV").unwrap_or_else(|_| "development".to_string())
}

fn json_output() -> bool {
    std::env::var("AGENTBUS_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn get_log_level(environment: &str) -> String {
    std::env::var("AGENTBUS_LOG_LEVEL").unwrap_or_else(|_| {
        match environment {
            "development" => "debug",
            "test" => "warn",
            _ => "info",
        }
        .to_string()
    })
}

/// Log a worker lifecycle transition with consistent fields
pub fn log_worker_lifecycle(worker_id: &str, worker_type: &str, event: &str, status: &str) {
    info!(
        worker_id = %worker_id,
        worker_type = %worker_type,
        event = %event,
        status = %status,
        "Worker lifecycle"
    );
}

/// Log the end of a task execution with consistent fields
pub fn log_task_operation(
    worker_id: &str,
    task_id: &str,
    outcome: &str,
    duration_ms: u64,
    error: Option<&str>,
) {
    match error {
        Some(error) => tracing::warn!(
            worker_id = %worker_id,
            task_id = %task_id,
            outcome = %outcome,
            duration_ms = duration_ms,
            error = %error,
            "Task finished"
        ),
        None => info!(
            worker_id = %worker_id,
            task_id = %task_id,
            outcome = %outcome,
            duration_ms = duration_ms,
            "Task finished"
        ),
    }
}
