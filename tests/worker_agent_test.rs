//! Worker agent lifecycle, task execution and failure reporting.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentbus_core::constants::{streams, system_events};
use agentbus_core::messaging::{DeliveryOutcome, MessageEnvelope, MessageKind, Payload};
use agentbus_core::worker::{
    SystemEvent, WorkerAgent, WorkerError, WorkerStatus, BUSY_ERROR,
};

use common::{
    fast_worker_config, in_memory_bus, payload, wait_until, FailingProcessor,
    RecordingProcessor, StreamObserver, StuckProcessor, UnstartableProcessor,
};

fn task_for(target: &str, correlation_id: &str) -> MessageEnvelope {
    MessageEnvelope::new(
        MessageKind::TaskRequest,
        "supervisor",
        payload(json!({ "task_type": "echo", "value": 7 })),
    )
    .with_target(target)
    .with_correlation_id(correlation_id)
}

#[tokio::test]
async fn test_targeted_task_round_trip() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let processor = Arc::new(RecordingProcessor::default());
    let worker = WorkerAgent::with_id("worker-1", processor.clone(), bus.clone(), fast_worker_config());
    worker.start().await.unwrap();
    assert_eq!(worker.status(), WorkerStatus::Idle);

    bus.publish(streams::SUPERVISOR_TASKS, &task_for("worker-1", "t1"))
        .await
        .unwrap();

    wait_until(Duration::from_secs(3), || !responses.with_correlation("t1").is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(responses.with_correlation("t1").len(), 1);
    let response = responses.with_correlation("t1").remove(0);
    assert_eq!(response.kind(), MessageKind::TaskResponse);
    assert_eq!(response.source(), "worker-1");
    assert_eq!(response.target(), Some("supervisor"));
    assert_eq!(response.payload()["success"], json!(true));
    assert_eq!(response.payload()["task_id"], json!("t1"));
    assert_eq!(response.payload()["result"]["echo"]["value"], json!(7));
    assert!(response.payload()["processing_time"].as_f64().unwrap() >= 0.0);

    assert_eq!(worker.status(), WorkerStatus::Idle);
    assert_eq!(worker.current_task_id(), None);
    let metrics = worker.metrics();
    assert_eq!(metrics.tasks_processed, 1);
    assert_eq!(metrics.tasks_successful, 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_task_rejected_while_busy() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let processor = Arc::new(RecordingProcessor::with_delay(Duration::from_millis(100)));
    let worker = WorkerAgent::with_id("worker-1", processor.clone(), bus.clone(), fast_worker_config());
    worker.start().await.unwrap();

    let (first, second) = tokio::join!(
        worker.handle_task(task_for("worker-1", "t1")),
        worker.handle_task(task_for("worker-1", "t2")),
    );
    assert_eq!(first, DeliveryOutcome::Handled);
    assert_eq!(second, DeliveryOutcome::Released);

    wait_until(Duration::from_secs(3), || responses.len() >= 2).await;
    let rejected = responses.with_correlation("t2").remove(0);
    assert_eq!(rejected.payload()["success"], json!(false));
    assert_eq!(rejected.payload()["error"], json!(BUSY_ERROR));
    assert_eq!(rejected.payload()["busy"], json!(true));
    assert_eq!(
        responses.with_correlation("t1")[0].payload()["success"],
        json!(true)
    );

    assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
    let metrics = worker.metrics();
    assert_eq!(metrics.tasks_processed, 1);
    assert_eq!(metrics.busy_rejections, 1);
    assert_eq!(worker.status(), WorkerStatus::Idle);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_prefetched_tasks_never_run_concurrently() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let processor = Arc::new(RecordingProcessor::with_delay(Duration::from_millis(50)));
    let mut config = fast_worker_config();
    config.task_prefetch = 2;
    let worker = WorkerAgent::with_id("worker-1", processor.clone(), bus.clone(), config);

    // Both land in the first read batch and are dispatched together
    for id in ["t1", "t2"] {
        bus.publish(streams::SUPERVISOR_TASKS, &task_for("worker-1", id))
            .await
            .unwrap();
    }
    worker.start().await.unwrap();

    wait_until(Duration::from_secs(3), || {
        responses.envelopes().iter().any(|e| e.payload()["busy"] == json!(true))
    })
    .await;
    assert!(processor.max_in_flight.load(Ordering::SeqCst) <= 1);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_stuck_processor_times_out_and_worker_recovers() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let worker = WorkerAgent::with_id("worker-1", Arc::new(StuckProcessor), bus.clone(), fast_worker_config());
    worker.start().await.unwrap();

    let outcome = worker.handle_task(task_for("worker-1", "t1")).await;
    assert_eq!(outcome, DeliveryOutcome::Handled);
    assert_eq!(worker.status(), WorkerStatus::Idle);

    wait_until(Duration::from_secs(2), || responses.len() == 1).await;
    let response = responses.envelopes().remove(0);
    assert_eq!(response.payload()["success"], json!(false));
    assert!(response.payload()["error"]
        .as_str()
        .unwrap()
        .contains("timed out"));
    assert_eq!(worker.metrics().failure_types.get("timeout"), Some(&1));

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_processor_error_and_panic_reported_as_failures() {
    for panic in [false, true] {
        let (_transport, bus) = in_memory_bus();
        let responses =
            StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
        let worker = WorkerAgent::with_id(
            "worker-1",
            Arc::new(FailingProcessor { panic }),
            bus.clone(),
            fast_worker_config(),
        );
        worker.start().await.unwrap();

        worker.handle_task(task_for("worker-1", "t1")).await;
        assert_eq!(worker.status(), WorkerStatus::Idle);

        wait_until(Duration::from_secs(2), || responses.len() == 1).await;
        let error = responses.envelopes()[0].payload()["error"]
            .as_str()
            .unwrap()
            .to_string();
        if panic {
            assert!(error.contains("processor exploded"), "{error}");
        } else {
            assert_eq!(error, "backend unavailable");
        }

        let metrics = worker.metrics();
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.failure_types.get("error"), Some(&1));
        assert!((metrics.error_rate - 1.0).abs() < f64::EPSILON);

        worker.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_stop_is_idempotent_and_announces_once() {
    let (_transport, bus) = in_memory_bus();
    let events = StreamObserver::attach(&bus, streams::SYSTEM_EVENTS, "ops").await;
    let worker = WorkerAgent::new(Arc::new(RecordingProcessor::default()), bus.clone(), fast_worker_config());
    assert!(worker.worker_id().starts_with("recording-"));
    worker.start().await.unwrap();
    worker.start().await.unwrap();

    worker.stop().await.unwrap();
    worker.stop().await.unwrap();
    assert_eq!(worker.status(), WorkerStatus::ShuttingDown);

    let count = |name: &str| {
        events
            .envelopes()
            .iter()
            .filter(|e| e.payload_str("event") == Some(name))
            .count()
    };
    wait_until(Duration::from_secs(2), || count(system_events::WORKER_SHUTDOWN) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count(system_events::WORKER_REGISTERED), 1);
    assert_eq!(count(system_events::WORKER_SHUTDOWN), 1);

    assert!(matches!(
        worker.start().await,
        Err(WorkerError::ShuttingDown { .. })
    ));
    // Tasks handed over after shutdown are rejected, never executed
    assert_eq!(
        worker.handle_task(task_for(worker.worker_id(), "late")).await,
        DeliveryOutcome::Released
    );
}

#[tokio::test]
async fn test_failed_startup_detaches_from_bus() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let broken = WorkerAgent::with_id(
        "worker-broken",
        Arc::new(UnstartableProcessor),
        bus.clone(),
        fast_worker_config(),
    );

    let err = broken.start().await.unwrap_err();
    assert!(matches!(err, WorkerError::Startup(ref reason) if reason.contains("model weights")));
    assert_eq!(broken.status(), WorkerStatus::Error);
    assert!(bus
        .active_subscriptions()
        .iter()
        .all(|s| s.consumer != "worker-broken"));
    assert!(matches!(broken.start().await, Err(WorkerError::Startup(_))));

    let processor = Arc::new(RecordingProcessor::default());
    let healthy = WorkerAgent::with_id("worker-ok", processor.clone(), bus.clone(), fast_worker_config());
    healthy.start().await.unwrap();
    for id in ["t1", "t2", "t3"] {
        let task = MessageEnvelope::new(
            MessageKind::TaskRequest,
            "supervisor",
            payload(json!({ "task_type": "echo" })),
        )
        .with_correlation_id(id);
        bus.publish(streams::SUPERVISOR_TASKS, &task).await.unwrap();
    }

    wait_until(Duration::from_secs(3), || responses.len() >= 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let responses = responses.envelopes();
    assert_eq!(responses.len(), 3);
    assert!(responses.iter().all(|r| r.source() == "worker-ok"));
    assert!(responses.iter().all(|r| r.payload()["success"] == json!(true)));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

    healthy.stop().await.unwrap();
    broken.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_before_start_skips_announcement() {
    let (_transport, bus) = in_memory_bus();
    let events = StreamObserver::attach(&bus, streams::SYSTEM_EVENTS, "ops").await;
    let worker = WorkerAgent::with_id(
        "worker-1",
        Arc::new(RecordingProcessor::default()),
        bus.clone(),
        fast_worker_config(),
    );

    worker.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(events.len(), 0);
}

#[tokio::test]
async fn test_shutdown_request_event_stops_worker() {
    let (_transport, bus) = in_memory_bus();
    let worker = WorkerAgent::with_id(
        "worker-1",
        Arc::new(RecordingProcessor::default()),
        bus.clone(),
        fast_worker_config(),
    );
    worker.start().await.unwrap();

    let request = SystemEvent::ShutdownRequest
        .to_envelope("ops", Payload::new())
        .with_target("worker-1");
    bus.publish(streams::SYSTEM_EVENTS, &request).await.unwrap();

    let observed = worker.clone();
    wait_until(Duration::from_secs(3), move || {
        observed.status() == WorkerStatus::ShuttingDown
    })
    .await;
    tokio::time::timeout(Duration::from_secs(3), worker.wait_stopped())
        .await
        .expect("requested stop should complete");
    assert!(bus
        .active_subscriptions()
        .iter()
        .all(|s| s.consumer != "worker-1"));
}

#[tokio::test]
async fn test_shutdown_request_for_other_worker_is_ignored() {
    let (_transport, bus) = in_memory_bus();
    let worker = WorkerAgent::with_id(
        "worker-1",
        Arc::new(RecordingProcessor::default()),
        bus.clone(),
        fast_worker_config(),
    );
    worker.start().await.unwrap();

    let request = SystemEvent::ShutdownRequest
        .to_envelope("ops", Payload::new())
        .with_target("worker-2");
    bus.publish(streams::SYSTEM_EVENTS, &request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(worker.status(), WorkerStatus::Idle);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_check_request_triggers_report() {
    let (_transport, bus) = in_memory_bus();
    let health = StreamObserver::attach(&bus, streams::HEALTH_CHECKS, "monitor").await;
    let mut config = fast_worker_config();
    config.heartbeat_interval_ms = 60_000;
    let worker = WorkerAgent::with_id("worker-1", Arc::new(RecordingProcessor::default()), bus.clone(), config);
    worker.start().await.unwrap();

    // The loop sends one heartbeat immediately
    wait_until(Duration::from_secs(2), || health.len() == 1).await;

    let request = SystemEvent::HealthCheckRequest.to_envelope("monitor", Payload::new());
    bus.publish(streams::SYSTEM_EVENTS, &request).await.unwrap();

    wait_until(Duration::from_secs(2), || health.len() == 2).await;
    let report = health.envelopes().remove(1);
    assert_eq!(report.kind(), MessageKind::HealthCheck);
    assert_eq!(report.payload()["worker_id"], json!("worker-1"));
    assert_eq!(report.payload()["status"], json!("idle"));

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_workers_share_untargeted_tasks() {
    let (_transport, bus) = in_memory_bus();
    let responses = StreamObserver::attach(&bus, streams::SUPERVISOR_RESPONSES, "supervisor").await;
    let first = Arc::new(RecordingProcessor::with_delay(Duration::from_millis(20)));
    let second = Arc::new(RecordingProcessor::with_delay(Duration::from_millis(20)));
    let a = WorkerAgent::with_id("worker-a", first.clone(), bus.clone(), fast_worker_config());
    let b = WorkerAgent::with_id("worker-b", second.clone(), bus.clone(), fast_worker_config());
    a.start().await.unwrap();
    b.start().await.unwrap();

    for n in 0..8 {
        let task = MessageEnvelope::new(
            MessageKind::TaskRequest,
            "supervisor",
            payload(json!({ "n": n })),
        );
        bus.publish(streams::SUPERVISOR_TASKS, &task).await.unwrap();
    }

    wait_until(Duration::from_secs(5), || responses.len() >= 8).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(responses.len(), 8);
    assert!(responses
        .envelopes()
        .iter()
        .all(|e| e.payload()["success"] == json!(true)));
    assert_eq!(
        first.calls.load(Ordering::SeqCst) + second.calls.load(Ordering::SeqCst),
        8
    );

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
