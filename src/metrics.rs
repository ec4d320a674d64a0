//! # Bus and Worker Metrics
//!
//! OpenTelemetry instruments for message flow and task execution. They record
//! through the global meter provider, so nothing is exported unless the hosting
//! process installs one.
//!
//! Labels:
//! - `stream`: log stream name (message counters)
//! - `worker_type`, `outcome`: task counters and durations

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static BUS_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    BUS_METER.get_or_init(|| opentelemetry::global::meter("agentbus-core"))
}

/// Envelopes successfully appended to a stream
pub fn messages_published_total() -> Counter<u64> {
    meter()
        .u64_counter("agentbus.messages.published")
        .with_description("Envelopes appended to a log stream")
        .build()
}

/// Envelopes handed to a subscription handler
pub fn messages_delivered_total() -> Counter<u64> {
    meter()
        .u64_counter("agentbus.messages.delivered")
        .with_description("Envelopes handed to subscription handlers")
        .build()
}

pub fn handler_errors_total() -> Counter<u64> {
    meter()
        .u64_counter("agentbus.handler.errors")
        .with_description("Subscription handler failures and panics")
        .build()
}

/// Tasks finished by workers, labelled by outcome (success, error, timeout, busy)
pub fn tasks_completed_total() -> Counter<u64> {
    meter()
        .u64_counter("agentbus.tasks.completed")
        .with_description("Tasks finished by worker agents")
        .build()
}

pub fn task_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("agentbus.tasks.duration")
        .with_description("Task execution time in milliseconds")
        .with_unit("ms")
        .build()
}
