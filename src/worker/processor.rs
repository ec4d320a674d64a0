//! The contract between the worker runtime and task-specific logic.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::WorkerCapability;
use crate::messaging::Payload;

/// What a processor reports for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Task-specific logic hosted by a `WorkerAgent`.
///
/// `process_task` is never called concurrently on one agent. Returning `Err` (or
/// panicking) is reported to the supervisor as a failed task, as is exceeding
/// the task timeout.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    fn worker_type(&self) -> &str;

    fn capabilities(&self) -> Vec<WorkerCapability> {
        Vec::new()
    }

    async fn process_task(&self, payload: &Payload) -> anyhow::Result<TaskOutcome>;

    /// Upper bound for one task of `task_type`; capped by the configured maximum
    fn task_timeout(&self, _task_type: Option<&str>) -> Option<Duration> {
        None
    }

    async fn on_startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
