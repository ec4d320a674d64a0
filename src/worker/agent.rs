//! # Worker Agent
//!
//! Runtime hosting a [`TaskProcessor`] on the bus. An agent consumes
//! `supervisor:tasks` as one member of the shared worker group, executes at most
//! one task at a time and reports every outcome (success, failure, timeout or
//! busy rejection) as a task-response envelope. Alongside it runs a heartbeat
//! loop publishing health snapshots to `health:checks` and a listener for
//! `system:events`.
//!
//! ## Lifecycle
//!
//! ```text
//! initializing -> idle <-> busy
//!        |         |        |
//!        +-------> error <--+
//!   any state -> shutting_down (terminal)
//! ```
//!
//! Busy state is claimed with a single check-and-set under the state lock and is
//! released by a drop guard, so a processor that fails, panics or times out can
//! never leave the agent stuck in `busy`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::capability::WorkerCapability;
use super::errors::{WorkerError, WorkerResult};
use super::events::SystemEvent;
use super::metrics::{WorkerMetrics, FAILURE_ERROR, FAILURE_TIMEOUT};
use super::processor::{TaskOutcome, TaskProcessor};
use super::state::WorkerStatus;
use crate::config::WorkerConfig;
use crate::constants::streams;
use crate::logging::{log_task_operation, log_worker_lifecycle};
use crate::messaging::{
    handler_fn, DeliveryOutcome, ForeignTargetPolicy, GroupStart, MessageBus, MessageEnvelope,
    MessageKind, MessagingResult, Payload, ShutdownListener, ShutdownSignal, SubscribeOptions,
    SubscriptionId,
};
use crate::metrics;
use crate::protocols::PROTOCOL_HEADER_KEY;

pub const BUSY_ERROR: &str = "Worker is busy";

/// Serializable view of an agent for supervisors and health endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthSnapshot {
    pub worker_id: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub capabilities: Vec<WorkerCapability>,
    pub metrics: WorkerMetrics,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub checked_at: DateTime<Utc>,
}

impl WorkerHealthSnapshot {
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    current_task_id: Option<String>,
}

/// Returns a busy agent to idle however task execution ends
struct BusyGuard<'a> {
    state: &'a Mutex<WorkerState>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.current_task_id = None;
        if state.status == WorkerStatus::Busy {
            state.status = WorkerStatus::Idle;
        }
    }
}

pub struct WorkerAgent {
    worker_id: String,
    worker_type: String,
    processor: Arc<dyn TaskProcessor>,
    bus: Arc<MessageBus>,
    config: WorkerConfig,
    state: Mutex<WorkerState>,
    metrics: Mutex<WorkerMetrics>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: ShutdownSignal,
    /// Triggered once `stop` has finished
    finished: ShutdownSignal,
    heartbeat: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    subscriptions: tokio::sync::Mutex<Vec<SubscriptionId>>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("worker_id", &self.worker_id)
            .field("worker_type", &self.worker_type)
            .field("status", &self.status())
            .finish()
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl WorkerAgent {
    /// Create an agent with a generated `<worker_type>-<8 hex>` id
    pub fn new(
        processor: Arc<dyn TaskProcessor>,
        bus: Arc<MessageBus>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let worker_id = format!("{}-{}", processor.worker_type(), &suffix[..8]);
        Self::with_id(worker_id, processor, bus, config)
    }

    pub fn with_id(
        worker_id: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
        bus: Arc<MessageBus>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id: worker_id.into(),
            worker_type: processor.worker_type().to_string(),
            processor,
            bus,
            config,
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Initializing,
                current_task_id: None,
            }),
            metrics: Mutex::new(WorkerMetrics::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            finished: ShutdownSignal::new(),
            heartbeat: tokio::sync::Mutex::new(None),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
            started_at: Utc::now(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.state.lock().current_task_id.clone()
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().clone()
    }

    pub fn get_health_status(&self) -> WorkerHealthSnapshot {
        let (status, current_task_id) = {
            let state = self.state.lock();
            (state.status, state.current_task_id.clone())
        };
        let now = Utc::now();
        WorkerHealthSnapshot {
            worker_id: self.worker_id.clone(),
            worker_type: self.worker_type.clone(),
            status,
            current_task_id,
            capabilities: self.processor.capabilities(),
            metrics: self.metrics(),
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).num_seconds(),
            checked_at: now,
        }
    }

    fn transition(&self, next: WorkerStatus) -> WorkerResult<()> {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: state.status,
                to: next,
            });
        }
        debug!(worker_id = %self.worker_id, from = %state.status, to = %next, "Worker transition");
        state.status = next;
        Ok(())
    }

    /// Subscribe, start heartbeats, announce the worker and run the startup hook.
    ///
    /// A second call is a no-op. When the startup hook fails the agent detaches
    /// from the bus, stays in `error` and cannot be started again.
    pub async fn start(self: &Arc<Self>) -> WorkerResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown {
                worker_id: self.worker_id.clone(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            if self.status() == WorkerStatus::Error {
                return Err(WorkerError::startup("an earlier start failed"));
            }
            return Ok(());
        }

        if let Err(e) = self.attach_to_bus().await {
            self.detach_from_bus().await;
            self.transition(WorkerStatus::Error)?;
            log_worker_lifecycle(&self.worker_id, &self.worker_type, "startup_failed", "error");
            return Err(e);
        }

        let mut details = Payload::new();
        details.insert("worker_id".to_string(), json!(self.worker_id));
        details.insert("worker_type".to_string(), json!(self.worker_type));
        details.insert(
            "capabilities".to_string(),
            serde_json::to_value(self.processor.capabilities()).unwrap_or(Value::Null),
        );
        if let Err(e) = self.emit_event(SystemEvent::WorkerRegistered, details).await {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to announce worker registration");
        }

        if let Err(e) = self.processor.on_startup().await {
            self.detach_from_bus().await;
            self.transition(WorkerStatus::Error)?;
            log_worker_lifecycle(&self.worker_id, &self.worker_type, "startup_failed", "error");
            return Err(WorkerError::startup(e.to_string()));
        }

        self.transition(WorkerStatus::Idle)?;
        log_worker_lifecycle(&self.worker_id, &self.worker_type, "started", "idle");
        Ok(())
    }

    /// Task and system-event subscriptions plus the heartbeat loop
    async fn attach_to_bus(self: &Arc<Self>) -> WorkerResult<()> {
        let agent = Arc::downgrade(self);
        let task_handler = handler_fn(move |envelope: MessageEnvelope| {
            let agent = agent.clone();
            async move {
                match agent.upgrade() {
                    Some(agent) => Ok(agent.handle_task(envelope).await),
                    None => Ok(DeliveryOutcome::Released),
                }
            }
        });
        let task_subscription = self
            .bus
            .subscribe(
                streams::SUPERVISOR_TASKS,
                task_handler,
                SubscribeOptions::new()
                    .with_group(self.config.task_group.clone())
                    .with_consumer(self.worker_id.clone())
                    .with_target_filter(self.worker_id.clone(), ForeignTargetPolicy::Release)
                    .with_max_in_flight(self.config.task_prefetch),
            )
            .await?;
        self.subscriptions.lock().await.push(task_subscription);

        let agent = Arc::downgrade(self);
        let event_handler = handler_fn(move |envelope: MessageEnvelope| {
            let agent = agent.clone();
            async move {
                if let Some(agent) = agent.upgrade() {
                    agent.handle_system_event(envelope).await;
                }
                Ok(DeliveryOutcome::Handled)
            }
        });
        let event_subscription = self
            .bus
            .subscribe(
                streams::SYSTEM_EVENTS,
                event_handler,
                SubscribeOptions::new()
                    .with_group(self.worker_id.clone())
                    .with_consumer(self.worker_id.clone())
                    .starting_at(GroupStart::Latest)
                    .with_target_filter(self.worker_id.clone(), ForeignTargetPolicy::Discard)
                    .temporary(),
            )
            .await?;
        self.subscriptions.lock().await.push(event_subscription);

        let handle = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.shutdown.listener(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_error_backoff(),
        ));
        *self.heartbeat.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the heartbeat loop and drop every subscription created so far
    async fn detach_from_bus(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.heartbeat.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(worker_id = %self.worker_id, error = %e, "Heartbeat loop ended abnormally");
            }
        }

        let subscriptions: Vec<SubscriptionId> =
            self.subscriptions.lock().await.drain(..).collect();
        for id in subscriptions {
            self.bus.unsubscribe(&id).await;
        }
    }

    /// Execute one delivered task, or reject it when the agent is not idle.
    ///
    /// Rejected tasks are released back to the group for another worker.
    pub async fn handle_task(&self, envelope: MessageEnvelope) -> DeliveryOutcome {
        let task_id = envelope
            .correlation_id()
            .unwrap_or_else(|| envelope.id())
            .to_string();

        let acquired = {
            let mut state = self.state.lock();
            if state.status.accepts_tasks() {
                state.status = WorkerStatus::Busy;
                state.current_task_id = Some(task_id.clone());
                true
            } else {
                false
            }
        };

        if !acquired {
            self.reject_busy(&envelope, &task_id).await;
            return DeliveryOutcome::Released;
        }

        let guard = BusyGuard { state: &self.state };

        let mut payload = envelope.payload().clone();
        payload.remove(PROTOCOL_HEADER_KEY);
        let task_type = payload
            .get("task_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let timeout = self.task_timeout(task_type.as_deref());

        debug!(worker_id = %self.worker_id, task_id = %task_id, task_type = ?task_type, "Task started");
        let started = Instant::now();
        let execution = AssertUnwindSafe(self.processor.process_task(&payload)).catch_unwind();
        let (outcome, failure_type) = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(Ok(outcome))) => (outcome, None),
            Ok(Ok(Err(e))) => (TaskOutcome::failure(e.to_string()), Some(FAILURE_ERROR)),
            Ok(Err(panic)) => (
                TaskOutcome::failure(format!("Task panicked: {}", panic_reason(panic.as_ref()))),
                Some(FAILURE_ERROR),
            ),
            Err(_) => (
                TaskOutcome::failure(format!(
                    "Task timed out after {}ms",
                    duration_ms(timeout)
                )),
                Some(FAILURE_TIMEOUT),
            ),
        };
        let elapsed = started.elapsed();
        drop(guard);

        let outcome_label = failure_type.unwrap_or("success");
        {
            let mut metrics = self.metrics.lock();
            match failure_type {
                None => metrics.record_success(elapsed.as_secs_f64() * 1000.0),
                Some(failure) => metrics.record_failure(failure),
            }
        }
        let labels = [
            KeyValue::new("worker_type", self.worker_type.clone()),
            KeyValue::new("outcome", outcome_label),
        ];
        metrics::tasks_completed_total().add(1, &labels);
        metrics::task_duration().record(elapsed.as_secs_f64() * 1000.0, &labels);
        log_task_operation(
            &self.worker_id,
            &task_id,
            outcome_label,
            duration_ms(elapsed),
            outcome.error.as_deref(),
        );

        let mut response = Payload::new();
        response.insert("success".to_string(), json!(outcome.success));
        response.insert("result".to_string(), outcome.result.unwrap_or(Value::Null));
        response.insert("error".to_string(), json!(outcome.error));
        response.insert("task_id".to_string(), json!(task_id));
        response.insert("worker_id".to_string(), json!(self.worker_id));
        response.insert(
            "processing_time".to_string(),
            json!(elapsed.as_secs_f64() * 1000.0),
        );
        self.respond(&envelope, response).await;

        DeliveryOutcome::Handled
    }

    async fn reject_busy(&self, envelope: &MessageEnvelope, task_id: &str) {
        self.metrics.lock().record_busy_rejection();
        metrics::tasks_completed_total().add(
            1,
            &[
                KeyValue::new("worker_type", self.worker_type.clone()),
                KeyValue::new("outcome", "busy"),
            ],
        );
        info!(worker_id = %self.worker_id, task_id = %task_id, status = %self.status(), "Rejecting task, worker busy");

        let mut response = Payload::new();
        response.insert("success".to_string(), json!(false));
        response.insert("result".to_string(), Value::Null);
        response.insert("error".to_string(), json!(BUSY_ERROR));
        response.insert("busy".to_string(), json!(true));
        response.insert("task_id".to_string(), json!(task_id));
        response.insert("worker_id".to_string(), json!(self.worker_id));
        self.respond(envelope, response).await;
    }

    async fn respond(&self, task: &MessageEnvelope, payload: Payload) {
        let stream = task
            .reply_to()
            .unwrap_or(streams::SUPERVISOR_RESPONSES)
            .to_string();
        let response = task.reply(self.worker_id.as_str(), MessageKind::TaskResponse, payload);
        if let Err(e) = self.bus.publish(&stream, &response).await {
            error!(
                worker_id = %self.worker_id,
                task_message_id = %task.id(),
                stream = %stream,
                error = %e,
                "Failed to publish task response"
            );
        }
    }

    fn task_timeout(&self, task_type: Option<&str>) -> Duration {
        let max = self.config.max_task_timeout();
        self.processor
            .task_timeout(task_type)
            .map_or(max, |timeout| timeout.min(max))
    }

    /// Publish the current health snapshot to `health:checks`
    pub async fn send_heartbeat(&self) -> MessagingResult<()> {
        let envelope = MessageEnvelope::new(
            MessageKind::HealthCheck,
            self.worker_id.as_str(),
            self.get_health_status().to_payload(),
        );
        self.bus.publish(streams::HEALTH_CHECKS, &envelope).await?;
        Ok(())
    }

    async fn emit_event(&self, event: SystemEvent, details: Payload) -> MessagingResult<()> {
        let envelope = event.to_envelope(&self.worker_id, details);
        self.bus.publish(streams::SYSTEM_EVENTS, &envelope).await?;
        Ok(())
    }

    async fn handle_system_event(self: Arc<Self>, envelope: MessageEnvelope) {
        match SystemEvent::from_envelope(&envelope) {
            Some(SystemEvent::HealthCheckRequest) => {
                if let Err(e) = self.send_heartbeat().await {
                    warn!(worker_id = %self.worker_id, error = %e, "Health report failed");
                }
            }
            Some(SystemEvent::ShutdownRequest) => {
                info!(worker_id = %self.worker_id, requested_by = %envelope.source(), "Shutdown requested");
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.stop().await {
                        warn!(worker_id = %agent.worker_id, error = %e, "Requested shutdown failed");
                    }
                });
            }
            Some(event) => {
                debug!(worker_id = %self.worker_id, event = %event.as_str(), "Ignoring system event");
            }
            None => {
                debug!(worker_id = %self.worker_id, message_id = %envelope.id(), "System event without a name");
            }
        }
    }

    /// Stop heartbeats and subscriptions, announce shutdown and run the shutdown hook.
    ///
    /// Idempotent; only the first call does any work. Waits for an in-flight task
    /// to finish. Must not be awaited from inside a task or event handler of this
    /// agent.
    pub async fn stop(&self) -> WorkerResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shut_down().await;
        self.finished.trigger();
        result
    }

    /// Resolves once `stop` has completed, whoever called it
    pub async fn wait_stopped(&self) {
        self.finished.listener().cancelled().await;
    }

    async fn shut_down(&self) -> WorkerResult<()> {
        self.transition(WorkerStatus::ShuttingDown)?;
        log_worker_lifecycle(&self.worker_id, &self.worker_type, "stopping", "shutting_down");

        self.detach_from_bus().await;

        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut details = Payload::new();
        details.insert("worker_id".to_string(), json!(self.worker_id));
        details.insert("worker_type".to_string(), json!(self.worker_type));
        details.insert("final_metrics".to_string(), Value::Object(self.metrics().to_payload()));
        if let Err(e) = self.emit_event(SystemEvent::WorkerShutdown, details).await {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to announce worker shutdown");
        }

        let hook = self.processor.on_shutdown().await;
        log_worker_lifecycle(&self.worker_id, &self.worker_type, "stopped", "shutting_down");
        hook.map_err(|e| WorkerError::shutdown(e.to_string()))
    }
}

impl Drop for WorkerAgent {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Immediate heartbeat, then one per interval; only cancellation or the agent
/// being dropped ends the loop.
async fn heartbeat_loop(
    agent: Weak<WorkerAgent>,
    mut listener: ShutdownListener,
    interval: Duration,
    error_backoff: Duration,
) {
    loop {
        let Some(current) = agent.upgrade() else {
            break;
        };

        let sent = tokio::select! {
            biased;
            _ = listener.cancelled() => break,
            sent = current.send_heartbeat() => sent,
        };
        let wait = match sent {
            Ok(()) => interval,
            Err(e) => {
                warn!(worker_id = %current.worker_id, error = %e, "Heartbeat failed, backing off");
                error_backoff
            }
        };
        drop(current);

        tokio::select! {
            biased;
            _ = listener.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Heartbeat loop stopped");
}
