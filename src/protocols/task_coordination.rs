//! # Task Coordination Protocol
//!
//! Tracks the assignment lifecycle of tasks between a supervisor and workers.
//!
//! The supervisor side assigns tasks on `supervisor:tasks` and folds progress,
//! acknowledgments and completions arriving on `supervisor:responses` into its
//! [`TaskRecord`]s. Completions may also be plain task-response envelopes
//! published by worker agents. The worker side records each assignment it
//! receives and acknowledges it to the assigner.
//!
//! Records are keyed by task id, which doubles as the correlation id of every
//! message about that task. Terminal records never regress.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::{ProtocolError, ProtocolResult};
use super::handler::{attach, ProtocolContext, ProtocolHandler};
use super::message::{CommunicationPattern, ProtocolAction, ProtocolMessage};
use crate::constants::{groups, streams};
use crate::messaging::{ForeignTargetPolicy, GroupStart, Payload, SubscribeOptions, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationRole {
    Supervisor,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRecordStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskRecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub worker_id: String,
    pub task_type: Option<String>,
    /// Agent that assigned the task
    pub assigned_by: String,
    pub status: TaskRecordStatus,
    pub assigned_at: DateTime<Utc>,
    pub progress: Option<Payload>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(task_id: String, worker_id: String, task_type: Option<String>, assigned_by: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            worker_id,
            task_type,
            assigned_by,
            status: TaskRecordStatus::Assigned,
            assigned_at: now,
            progress: None,
            completed_at: None,
            result: None,
            error: None,
            updated_at: now,
        }
    }

    fn mark_in_progress(&mut self, progress: Option<Payload>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskRecordStatus::InProgress;
        if progress.is_some() {
            self.progress = progress;
        }
        self.updated_at = Utc::now();
        true
    }

    fn finish(&mut self, success: bool, result: Option<Value>, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = if success {
            TaskRecordStatus::Completed
        } else {
            TaskRecordStatus::Failed
        };
        self.result = result.filter(|value| !value.is_null());
        self.error = error;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}

pub struct TaskCoordinationProtocol {
    context: ProtocolContext,
    role: CoordinationRole,
    tasks: DashMap<String, TaskRecord>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for TaskCoordinationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinationProtocol")
            .field("agent_id", &self.context.agent_id())
            .field("role", &self.role)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

fn task_id_of(message: &ProtocolMessage) -> Option<String> {
    message
        .correlation_id()
        .or_else(|| message.payload().get("task_id").and_then(Value::as_str))
        .map(str::to_string)
}

impl TaskCoordinationProtocol {
    pub fn new(context: ProtocolContext, role: CoordinationRole) -> Self {
        Self {
            context,
            role,
            tasks: DashMap::new(),
            subscription: Mutex::new(None),
        }
    }

    pub fn role(&self) -> CoordinationRole {
        self.role
    }

    /// Subscribe to the stream this role consumes: responses for a supervisor,
    /// the shared task stream for a worker.
    pub async fn listen(self: &Arc<Self>) -> ProtocolResult<SubscriptionId> {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = subscription.as_ref() {
            return Ok(id.clone());
        }

        let agent_id = self.context.agent_id().to_string();
        let (stream, options) = match self.role {
            CoordinationRole::Supervisor => (
                streams::SUPERVISOR_RESPONSES,
                SubscribeOptions::new()
                    .with_group(agent_id.clone())
                    .with_consumer(agent_id.clone())
                    .starting_at(GroupStart::Latest)
                    .with_target_filter(agent_id, ForeignTargetPolicy::Discard),
            ),
            CoordinationRole::Worker => (
                streams::SUPERVISOR_TASKS,
                SubscribeOptions::new()
                    .with_group(groups::WORKERS)
                    .with_consumer(agent_id.clone())
                    .with_target_filter(agent_id, ForeignTargetPolicy::Release),
            ),
        };

        let id = attach(self, stream, options).await?;
        info!(agent_id = %self.context.agent_id(), role = ?self.role, stream = %stream, "Task coordination listening");
        *subscription = Some(id.clone());
        Ok(id)
    }

    pub async fn close(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            self.context.bus().unsubscribe(&id).await;
        }
    }

    /// Record and publish a new assignment for `worker_id`, returning the task id
    pub async fn assign_task(
        &self,
        worker_id: &str,
        task_type: &str,
        mut payload: Payload,
    ) -> ProtocolResult<String> {
        let task_id = Uuid::new_v4().to_string();
        payload.insert("task_id".to_string(), json!(task_id));
        payload.insert("task_type".to_string(), json!(task_type));

        self.tasks.insert(
            task_id.clone(),
            TaskRecord::new(
                task_id.clone(),
                worker_id.to_string(),
                Some(task_type.to_string()),
                self.context.agent_id().to_string(),
            ),
        );

        let message = ProtocolMessage::new(
            ProtocolAction::TaskAssignment,
            self.context.agent_id(),
            payload,
        )
        .with_target(worker_id)
        .with_correlation(task_id.clone(), streams::SUPERVISOR_RESPONSES);

        match self.context.send(streams::SUPERVISOR_TASKS, message).await {
            Ok(Some(_)) => {
                info!(task_id = %task_id, worker_id = %worker_id, task_type = %task_type, "Task assigned");
                Ok(task_id)
            }
            Ok(None) => {
                self.tasks.remove(&task_id);
                Err(ProtocolError::rejected(
                    "outbound",
                    "task assignment rejected by middleware",
                ))
            }
            Err(e) => {
                self.tasks.remove(&task_id);
                Err(e)
            }
        }
    }

    /// Worker side: publish progress for `task_id` to the supervisor
    pub async fn report_task_progress(&self, task_id: &str, progress: Payload) -> ProtocolResult<()> {
        let assigner = self.tasks.get_mut(task_id).map(|mut record| {
            record.mark_in_progress(Some(progress.clone()));
            record.assigned_by.clone()
        });

        let mut payload = Payload::new();
        payload.insert("task_id".to_string(), json!(task_id));
        payload.insert("worker_id".to_string(), json!(self.context.agent_id()));
        payload.insert("progress".to_string(), Value::Object(progress));

        self.send_update(ProtocolAction::TaskProgress, task_id, assigner, payload)
            .await
    }

    /// Worker side: publish the final outcome of `task_id` to the supervisor
    pub async fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> ProtocolResult<()> {
        let assigner = self.tasks.get_mut(task_id).map(|mut record| {
            record.finish(success, result.clone(), error.clone());
            record.assigned_by.clone()
        });

        let mut payload = Payload::new();
        payload.insert("task_id".to_string(), json!(task_id));
        payload.insert("worker_id".to_string(), json!(self.context.agent_id()));
        payload.insert("success".to_string(), json!(success));
        payload.insert("result".to_string(), result.unwrap_or(Value::Null));
        payload.insert("error".to_string(), json!(error));

        self.send_update(ProtocolAction::TaskCompletion, task_id, assigner, payload)
            .await
    }

    async fn send_update(
        &self,
        action: ProtocolAction,
        task_id: &str,
        assigner: Option<String>,
        payload: Payload,
    ) -> ProtocolResult<()> {
        let mut message = ProtocolMessage::new(action, self.context.agent_id(), payload)
            .with_correlation_id(task_id);
        if let Some(assigner) = assigner {
            message = message.with_target(assigner);
        }
        match self.context.send(streams::SUPERVISOR_RESPONSES, message).await? {
            Some(_) => Ok(()),
            None => Err(ProtocolError::rejected(
                "outbound",
                format!("{action} for task {task_id} rejected by middleware"),
            )),
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|record| record.clone())
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.tasks.iter().map(|r| r.value().clone()).collect();
        tasks.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at));
        tasks
    }

    /// Plain JSON view of a record for outward-facing APIs
    pub fn task_snapshot(&self, task_id: &str) -> Option<Value> {
        self.get_task(task_id)
            .and_then(|record| serde_json::to_value(record).ok())
    }

    fn handle_supervisor_message(&self, message: &ProtocolMessage) -> ProtocolResult<()> {
        let task_id = task_id_of(message)
            .ok_or_else(|| ProtocolError::invalid_message("task update without task id"))?;

        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| ProtocolError::UnknownTask(task_id.clone()))?;

        let payload = message.payload();
        let applied = match message.action {
            ProtocolAction::TaskAcknowledgment => record.mark_in_progress(None),
            ProtocolAction::TaskProgress => {
                let progress = payload
                    .get("progress")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(|| payload.clone());
                record.mark_in_progress(Some(progress))
            }
            ProtocolAction::TaskCompletion => {
                if payload.get("busy").and_then(Value::as_bool).unwrap_or(false) {
                    debug!(task_id = %task_id, worker = %message.source(), "Worker busy, task awaits redelivery");
                    return Ok(());
                }
                let success = payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let error = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                record.finish(success, payload.get("result").cloned(), error)
            }
            action => return Err(ProtocolError::unsupported(self.pattern(), action)),
        };

        if applied {
            debug!(task_id = %task_id, status = ?record.status, "Task record updated");
        } else {
            debug!(task_id = %task_id, action = %message.action, "Ignoring update for finished task");
        }
        Ok(())
    }

    fn handle_worker_message(&self, message: &ProtocolMessage) -> ProtocolResult<Option<ProtocolMessage>> {
        if message.action != ProtocolAction::TaskAssignment {
            return Err(ProtocolError::unsupported(self.pattern(), message.action));
        }
        let agent_id = self.context.agent_id();
        if message.envelope.target().is_some_and(|target| target != agent_id) {
            return Ok(None);
        }

        let task_id = task_id_of(message).unwrap_or_else(|| message.id().to_string());
        let task_type = message.envelope.payload_str("task_type").map(str::to_string);
        self.tasks.entry(task_id.clone()).or_insert_with(|| {
            TaskRecord::new(
                task_id.clone(),
                agent_id.to_string(),
                task_type,
                message.source().to_string(),
            )
        });
        info!(task_id = %task_id, worker_id = %agent_id, assigner = %message.source(), "Task assignment received");

        let mut ack = Payload::new();
        ack.insert("task_id".to_string(), json!(task_id));
        ack.insert("worker_id".to_string(), json!(agent_id));
        ack.insert("status".to_string(), json!("acknowledged"));
        let reply = message
            .reply(agent_id, ProtocolAction::TaskAcknowledgment, ack)
            .with_correlation_id(task_id);
        Ok(Some(reply))
    }
}

#[async_trait]
impl ProtocolHandler for TaskCoordinationProtocol {
    fn pattern(&self) -> CommunicationPattern {
        CommunicationPattern::TaskCoordination
    }

    fn context(&self) -> &ProtocolContext {
        &self.context
    }

    async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> ProtocolResult<Option<ProtocolMessage>> {
        match self.role {
            CoordinationRole::Supervisor => {
                self.handle_supervisor_message(&message)?;
                Ok(None)
            }
            CoordinationRole::Worker => self.handle_worker_message(&message),
        }
    }
}
