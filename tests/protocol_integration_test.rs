//! Protocol layer end to end over one in-memory bus.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use agentbus_core::config::{HealthConfig, ProtocolConfig};
use agentbus_core::constants::response_stream;
use agentbus_core::messaging::{MessageBus, MessageKind, Payload};
use agentbus_core::protocols::{
    topic_handler, AgentHealthStatus, CoordinationRole, HealthMonitoringProtocol,
    HealthReporter, MiddlewareChain, ProtocolAction, ProtocolContext, ProtocolError,
    ProtocolMessage, PublishSubscribeProtocol, RequestHandler, RequestResponseProtocol,
    TaskCoordinationProtocol, TaskRecordStatus,
};
use agentbus_core::worker::WorkerAgent;

use common::{
    fast_worker_config, in_memory_bus, payload, wait_until, RecordingProcessor, StreamObserver,
};

fn context(agent_id: &str, bus: &Arc<MessageBus>) -> ProtocolContext {
    ProtocolContext::new(
        agent_id,
        bus.clone(),
        MiddlewareChain::from_config(&ProtocolConfig::default()),
    )
}

struct Adder;

#[async_trait]
impl RequestHandler for Adder {
    async fn handle_request(&self, request: &ProtocolMessage) -> anyhow::Result<Payload> {
        let a = request.payload().get("a").and_then(|v| v.as_i64());
        let b = request.payload().get("b").and_then(|v| v.as_i64());
        match (a, b) {
            (Some(a), Some(b)) => Ok(payload(json!({ "sum": a + b }))),
            _ => anyhow::bail!("operands missing"),
        }
    }
}

#[tokio::test]
async fn test_request_response_protocol_round_trip() {
    let (_transport, bus) = in_memory_bus();
    let server = Arc::new(
        RequestResponseProtocol::new(context("calc-server", &bus))
            .with_request_handler(Arc::new(Adder)),
    );
    server.serve("calc", "calculators").await.unwrap();
    let client = Arc::new(RequestResponseProtocol::new(context("client-1", &bus)));

    let response = client
        .send_request("calc", payload(json!({ "a": 2, "b": 3 })), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.action, ProtocolAction::Response);
    assert_eq!(response.source(), "calc-server");
    assert_eq!(response.payload()["sum"], json!(5));
    assert_eq!(response.payload()["success"], json!(true));

    let failed = client
        .send_request("calc", payload(json!({ "a": 2 })), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(failed.payload()["success"], json!(false));
    assert_eq!(failed.payload()["error"], json!("operands missing"));

    assert_eq!(server.requests_served(), 2);
    assert_eq!(client.pending_requests(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_request_without_server_times_out_and_clears_pending() {
    let (_transport, bus) = in_memory_bus();
    let client = Arc::new(RequestResponseProtocol::new(context("client-1", &bus)));

    let result = client
        .send_request("void", Payload::new(), Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(ProtocolError::RequestTimeout { .. })));
    assert_eq!(client.pending_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_reply_after_timeout_is_dropped_and_never_resolves_a_later_request() {
    let (_transport, bus) = in_memory_bus();
    let client = Arc::new(RequestResponseProtocol::new(context("client-1", &bus)));
    let requests = StreamObserver::attach(&bus, "slow", "eavesdropper").await;

    let result = client
        .send_request("slow", payload(json!({ "n": 1 })), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(ProtocolError::RequestTimeout { .. })));
    wait_until(Duration::from_secs(2), || requests.len() == 1).await;

    let stale = requests.envelopes()[0].reply(
        "slow-server",
        MessageKind::TaskResponse,
        payload(json!({ "answer": "stale" })),
    );
    bus.publish(&response_stream("slow"), &stale).await.unwrap();
    let late = client.clone();
    wait_until(Duration::from_secs(2), move || late.late_responses() == 1).await;
    assert_eq!(client.pending_requests(), 0);

    let second = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request("slow", payload(json!({ "n": 2 })), Duration::from_secs(3))
                .await
        })
    };
    wait_until(Duration::from_secs(2), || requests.len() == 2).await;

    // The stale reply shows up again ahead of the real one
    bus.publish(&response_stream("slow"), &stale).await.unwrap();
    let fresh = requests.envelopes()[1].reply(
        "slow-server",
        MessageKind::TaskResponse,
        payload(json!({ "answer": "fresh" })),
    );
    bus.publish(&response_stream("slow"), &fresh).await.unwrap();

    let response = second.await.unwrap().unwrap();
    assert_eq!(response.payload()["answer"], json!("fresh"));
    assert_eq!(response.correlation_id(), fresh.correlation_id());
    assert_eq!(client.late_responses(), 2);

    client.close().await;
}

#[tokio::test]
async fn test_pubsub_fans_out_and_isolates_failing_handlers() {
    let (_transport, bus) = in_memory_bus();
    let publisher = Arc::new(PublishSubscribeProtocol::new(context("publisher", &bus)));
    let first = Arc::new(PublishSubscribeProtocol::new(context("listener-1", &bus)));
    let second = Arc::new(PublishSubscribeProtocol::new(context("listener-2", &bus)));

    let first_seen = Arc::new(AtomicUsize::new(0));
    let counter = first_seen.clone();
    first
        .subscribe(
            "alerts",
            topic_handler(|_message| async move {
                Err::<(), _>(anyhow::anyhow!("handler broke"))
            }),
        )
        .await
        .unwrap();
    first
        .subscribe(
            "alerts",
            topic_handler(move |_message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(first.handler_count("alerts"), 2);

    let second_seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = second_seen.clone();
    second
        .subscribe(
            "alerts",
            topic_handler(move |message: ProtocolMessage| {
                let sink = sink.clone();
                async move {
                    let level = message.payload()["level"].as_str().unwrap_or_default();
                    sink.lock().push(level.to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let sent = publisher
        .publish("alerts", payload(json!({ "level": "critical" })))
        .await
        .unwrap();
    assert!(sent.is_some());

    wait_until(Duration::from_secs(3), || {
        first_seen.load(Ordering::SeqCst) == 1 && second_seen.lock().len() == 1
    })
    .await;
    assert_eq!(first.handler_failures(), 1);
    assert_eq!(first.dispatched(), 2);
    assert_eq!(second_seen.lock().as_slice(), ["critical".to_string()]);

    assert!(first.unsubscribe("alerts").await);
    assert!(first.topics().is_empty());
    publisher
        .publish("alerts", payload(json!({ "level": "info" })))
        .await
        .unwrap();
    wait_until(Duration::from_secs(3), || second_seen.lock().len() == 2).await;
    assert_eq!(first_seen.load(Ordering::SeqCst), 1);

    second.close().await;
}

#[tokio::test]
async fn test_supervisor_tracks_task_completed_by_worker_agent() {
    let (_transport, bus) = in_memory_bus();
    let supervisor = Arc::new(TaskCoordinationProtocol::new(
        context("supervisor-1", &bus),
        CoordinationRole::Supervisor,
    ));
    supervisor.listen().await.unwrap();

    let processor = Arc::new(RecordingProcessor::default());
    let worker = WorkerAgent::with_id("worker-1", processor, bus.clone(), fast_worker_config());
    worker.start().await.unwrap();

    let task_id = supervisor
        .assign_task("worker-1", "echo", payload(json!({ "value": 11 })))
        .await
        .unwrap();
    assert_eq!(
        supervisor.get_task(&task_id).unwrap().status,
        TaskRecordStatus::Assigned
    );

    let watcher = supervisor.clone();
    let id = task_id.clone();
    wait_until(Duration::from_secs(3), move || {
        watcher
            .get_task(&id)
            .is_some_and(|record| record.status.is_terminal())
    })
    .await;

    let record = supervisor.get_task(&task_id).unwrap();
    assert_eq!(record.status, TaskRecordStatus::Completed);
    assert_eq!(record.worker_id, "worker-1");
    assert_eq!(record.task_type.as_deref(), Some("echo"));
    let result = record.result.unwrap();
    assert_eq!(result["echo"]["value"], json!(11));
    // The protocol header never reaches the processor
    assert!(result["echo"].get("protocol").is_none());
    assert!(supervisor.task_snapshot(&task_id).is_some());

    worker.stop().await.unwrap();
    supervisor.close().await;
}

#[tokio::test]
async fn test_worker_role_acknowledges_reports_and_completes() {
    let (_transport, bus) = in_memory_bus();
    let supervisor = Arc::new(TaskCoordinationProtocol::new(
        context("supervisor-1", &bus),
        CoordinationRole::Supervisor,
    ));
    supervisor.listen().await.unwrap();
    let worker = Arc::new(TaskCoordinationProtocol::new(
        context("worker-9", &bus),
        CoordinationRole::Worker,
    ));
    worker.listen().await.unwrap();

    let task_id = supervisor
        .assign_task("worker-9", "analyze", payload(json!({ "doc": "a.txt" })))
        .await
        .unwrap();

    let status_of = |status: TaskRecordStatus| {
        let supervisor = supervisor.clone();
        let task_id = task_id.clone();
        move || supervisor.get_task(&task_id).is_some_and(|r| r.status == status)
    };

    // Acknowledgment moves the record forward
    wait_until(Duration::from_secs(3), status_of(TaskRecordStatus::InProgress)).await;
    let received = worker.get_task(&task_id).unwrap();
    assert_eq!(received.assigned_by, "supervisor-1");
    assert_eq!(received.task_type.as_deref(), Some("analyze"));

    worker
        .report_task_progress(&task_id, payload(json!({ "percent": 50 })))
        .await
        .unwrap();
    let watcher = supervisor.clone();
    let id = task_id.clone();
    wait_until(Duration::from_secs(3), move || {
        watcher
            .get_task(&id)
            .and_then(|r| r.progress)
            .is_some_and(|p| p["percent"] == json!(50))
    })
    .await;

    worker
        .complete_task(&task_id, false, None, Some("parser crashed".to_string()))
        .await
        .unwrap();
    wait_until(Duration::from_secs(3), status_of(TaskRecordStatus::Failed)).await;
    let record = supervisor.get_task(&task_id).unwrap();
    assert_eq!(record.error.as_deref(), Some("parser crashed"));
    assert!(record.completed_at.is_some());
    assert_eq!(worker.get_task(&task_id).unwrap().status, TaskRecordStatus::Failed);

    // Finished records do not regress
    worker
        .report_task_progress(&task_id, payload(json!({ "percent": 99 })))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        supervisor.get_task(&task_id).unwrap().status,
        TaskRecordStatus::Failed
    );

    worker.close().await;
    supervisor.close().await;
}

#[tokio::test]
async fn test_invalid_assignment_is_rejected_before_sending() {
    let (_transport, bus) = in_memory_bus();
    let ctx = context("supervisor-1", &bus);

    let untargeted = ProtocolMessage::new(
        ProtocolAction::TaskAssignment,
        "supervisor-1",
        Payload::new(),
    );
    let sent = ctx.send("supervisor:tasks", untargeted).await.unwrap();

    assert!(sent.is_none());
    assert_eq!(ctx.stats().rejected, 1);
    assert_eq!(ctx.middleware().rejected(), 1);
    assert_eq!(bus.stats().published, 0);
}

struct FixedReport(AgentHealthStatus);

#[async_trait]
impl HealthReporter for FixedReport {
    async fn health_report(&self) -> anyhow::Result<(AgentHealthStatus, Payload)> {
        Ok((self.0, payload(json!({ "load": 0.9 }))))
    }
}

#[tokio::test]
async fn test_monitor_absorbs_worker_heartbeats() {
    let (_transport, bus) = in_memory_bus();
    let monitor = Arc::new(HealthMonitoringProtocol::new(
        context("monitor", &bus),
        HealthConfig::default(),
    ));
    monitor.listen().await.unwrap();

    let worker = WorkerAgent::with_id(
        "worker-1",
        Arc::new(RecordingProcessor::default()),
        bus.clone(),
        fast_worker_config(),
    );
    worker.start().await.unwrap();

    let watcher = monitor.clone();
    wait_until(Duration::from_secs(3), move || {
        watcher
            .get_agent_health("worker-1")
            .is_some_and(|h| h.reported_status == "idle")
    })
    .await;
    let health = monitor.get_agent_health("worker-1").unwrap();
    assert_eq!(health.status, AgentHealthStatus::Healthy);
    assert!(health.metrics.is_empty() || health.metrics.contains_key("tasks_processed"));

    let system = monitor.get_system_health();
    assert_eq!(system.total_agents, 1);
    assert_eq!(system.status, AgentHealthStatus::Healthy);

    worker.stop().await.unwrap();
    monitor.close().await;
}

#[tokio::test]
async fn test_targeted_health_check_gets_answered() {
    let (_transport, bus) = in_memory_bus();
    let monitor = Arc::new(HealthMonitoringProtocol::new(
        context("monitor", &bus),
        HealthConfig::default(),
    ));
    monitor.listen().await.unwrap();
    let agent = Arc::new(
        HealthMonitoringProtocol::new(context("agent-a", &bus), HealthConfig::default())
            .with_reporter(Arc::new(FixedReport(AgentHealthStatus::Degraded))),
    );
    agent.listen().await.unwrap();

    monitor.request_health_check(Some("agent-a")).await.unwrap();

    let watcher = monitor.clone();
    wait_until(Duration::from_secs(3), move || {
        watcher.get_agent_health("agent-a").is_some()
    })
    .await;
    let health = monitor.get_agent_health("agent-a").unwrap();
    assert_eq!(health.status, AgentHealthStatus::Degraded);
    assert_eq!(health.metrics["load"], json!(0.9));
    assert_eq!(
        monitor.history().last().map(|r| r.action),
        Some(ProtocolAction::HealthCheckResponse)
    );
    assert_eq!(monitor.get_system_health().status, AgentHealthStatus::Degraded);

    agent.close().await;
    monitor.close().await;
}

#[tokio::test]
async fn test_failed_health_check_marks_target_unhealthy() {
    let (transport, bus) = in_memory_bus();
    let monitor = HealthMonitoringProtocol::new(context("monitor", &bus), HealthConfig::default());

    transport.set_available(false);
    let result = monitor.request_health_check(Some("agent-z")).await;
    assert!(result.is_err());

    let health = monitor.get_agent_health("agent-z").unwrap();
    assert_eq!(health.status, AgentHealthStatus::Unhealthy);
    assert!(health.metrics.contains_key("error"));
}

#[tokio::test]
async fn test_health_history_is_bounded_and_silence_goes_stale() {
    let (_transport, bus) = in_memory_bus();
    let config = HealthConfig {
        history_size: 3,
        heartbeat_timeout_ms: 100,
    };
    let monitor = Arc::new(HealthMonitoringProtocol::new(context("monitor", &bus), config));
    monitor.listen().await.unwrap();
    let agent = HealthMonitoringProtocol::new(context("agent-b", &bus), HealthConfig::default());

    for seq in 0..5 {
        agent
            .send_heartbeat(AgentHealthStatus::Healthy, payload(json!({ "seq": seq })))
            .await
            .unwrap();
    }

    let watcher = monitor.clone();
    wait_until(Duration::from_secs(3), move || {
        watcher
            .get_agent_health("agent-b")
            .is_some_and(|h| h.metrics.get("seq") == Some(&json!(4)))
    })
    .await;
    let history = monitor.history();
    assert_eq!(history.len(), 3);
    assert!(history
        .iter()
        .all(|r| r.agent_id == "agent-b" && r.action == ProtocolAction::Heartbeat));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let system = monitor.get_system_health();
    assert_eq!(system.stale_agents, vec!["agent-b".to_string()]);
    assert_eq!(system.status, AgentHealthStatus::Degraded);

    monitor.close().await;
}
