//! Shared fixtures: fast timings, processors with controllable behavior and
//! stream observers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use agentbus_core::config::{BusConfig, WorkerConfig};
use agentbus_core::messaging::{
    handler_fn, DeliveryOutcome, InMemoryLogStream, MessageBus, MessageEnvelope, Payload,
    SubscribeOptions, SubscriptionId,
};
use agentbus_core::worker::{TaskOutcome, TaskProcessor};

pub fn fast_bus_config() -> BusConfig {
    BusConfig {
        block_timeout_ms: 20,
        claim_interval_ms: 20,
        visibility_timeout_ms: 300,
        error_backoff_ms: 10,
        publish_timeout_ms: 1_000,
        ..BusConfig::default()
    }
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval_ms: 50,
        heartbeat_error_backoff_ms: 20,
        max_task_timeout_ms: 200,
        ..WorkerConfig::default()
    }
}

pub fn in_memory_bus() -> (Arc<InMemoryLogStream>, Arc<MessageBus>) {
    let transport = Arc::new(InMemoryLogStream::new());
    let bus = Arc::new(MessageBus::new(transport.clone(), fast_bus_config()));
    (transport, bus)
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Records every envelope seen on a stream through a private group
pub struct StreamObserver {
    pub subscription: SubscriptionId,
    seen: Arc<Mutex<Vec<MessageEnvelope>>>,
}

impl StreamObserver {
    pub async fn attach(bus: &MessageBus, stream: &str, group: &str) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = bus
            .subscribe(
                stream,
                handler_fn(move |envelope: MessageEnvelope| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().push(envelope);
                        Ok(DeliveryOutcome::Handled)
                    }
                }),
                SubscribeOptions::new().with_group(group).with_consumer(group),
            )
            .await
            .expect("observer subscription");
        Self { subscription, seen }
    }

    pub fn envelopes(&self) -> Vec<MessageEnvelope> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn with_correlation(&self, correlation_id: &str) -> Vec<MessageEnvelope> {
        self.seen
            .lock()
            .iter()
            .filter(|e| e.correlation_id() == Some(correlation_id))
            .cloned()
            .collect()
    }
}

/// Echoes payloads after an optional delay; counts and tracks concurrency
#[derive(Default)]
pub struct RecordingProcessor {
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl RecordingProcessor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl TaskProcessor for RecordingProcessor {
    fn worker_type(&self) -> &str {
        "recording"
    }

    async fn process_task(&self, payload: &Payload) -> anyhow::Result<TaskOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskOutcome::success(json!({ "echo": Value::Object(payload.clone()) })))
    }
}

/// Never finishes a task
pub struct StuckProcessor;

#[async_trait]
impl TaskProcessor for StuckProcessor {
    fn worker_type(&self) -> &str {
        "stuck"
    }

    async fn process_task(&self, _payload: &Payload) -> anyhow::Result<TaskOutcome> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Fails every task, by error or by panic
pub struct FailingProcessor {
    pub panic: bool,
}

#[async_trait]
impl TaskProcessor for FailingProcessor {
    fn worker_type(&self) -> &str {
        "failing"
    }

    async fn process_task(&self, _payload: &Payload) -> anyhow::Result<TaskOutcome> {
        if self.panic {
            panic!("processor exploded");
        }
        anyhow::bail!("backend unavailable")
    }
}

/// Startup hook always fails
pub struct UnstartableProcessor;

#[async_trait]
impl TaskProcessor for UnstartableProcessor {
    fn worker_type(&self) -> &str {
        "unstartable"
    }

    async fn process_task(&self, _payload: &Payload) -> anyhow::Result<TaskOutcome> {
        Ok(TaskOutcome::success(json!({})))
    }

    async fn on_startup(&self) -> anyhow::Result<()> {
        anyhow::bail!("model weights missing")
    }
}
