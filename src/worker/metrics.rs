//! Per-agent task counters reported in heartbeats and health snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FAILURE_TIMEOUT: &str = "timeout";
pub const FAILURE_ERROR: &str = "error";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    /// Tasks turned away because the worker was busy; not counted as processed
    pub busy_rejections: u64,
    /// Sum over successful tasks only
    pub total_processing_time_ms: f64,
    pub average_processing_time_ms: f64,
    /// `tasks_failed / tasks_processed`, 0 when nothing was processed
    pub error_rate: f64,
    pub failure_types: HashMap<String, u64>,
    pub last_task_at: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    pub fn record_success(&mut self, duration_ms: f64) {
        self.tasks_processed += 1;
        self.tasks_successful += 1;
        self.total_processing_time_ms += duration_ms.max(0.0);
        self.average_processing_time_ms =
            self.total_processing_time_ms / self.tasks_successful as f64;
        self.finish_task();
    }

    pub fn record_failure(&mut self, failure_type: &str) {
        self.tasks_processed += 1;
        self.tasks_failed += 1;
        *self
            .failure_types
            .entry(failure_type.to_string())
            .or_insert(0) += 1;
        self.finish_task();
    }

    pub fn record_busy_rejection(&mut self) {
        self.busy_rejections += 1;
    }

    fn finish_task(&mut self) {
        self.error_rate = self.tasks_failed as f64 / self.tasks_processed as f64;
        self.last_task_at = Some(Utc::now());
    }

    pub fn to_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
