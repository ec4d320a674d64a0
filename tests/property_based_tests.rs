//! Property-based checks for the wire codec, protocol framing and worker metrics.

mod common;

use proptest::prelude::*;

use agentbus_core::messaging::MessageEnvelope;
use agentbus_core::protocols::{ProtocolAction, ProtocolMessage, PROTOCOL_HEADER_KEY};
use agentbus_core::worker::WorkerMetrics;

use common::strategies::{envelope_strategy, payload_strategy, task_results_strategy};

proptest! {
    #[test]
    fn wire_fields_preserve_every_envelope_field(envelope in envelope_strategy()) {
        let fields = envelope.to_wire_fields().unwrap();
        let decoded = MessageEnvelope::from_wire_fields(&fields).unwrap();

        prop_assert_eq!(decoded.id(), envelope.id());
        prop_assert_eq!(decoded.kind(), envelope.kind());
        prop_assert_eq!(decoded.priority(), envelope.priority());
        prop_assert_eq!(decoded.source(), envelope.source());
        prop_assert_eq!(decoded.target(), envelope.target());
        prop_assert_eq!(decoded.correlation_id(), envelope.correlation_id());
        prop_assert_eq!(decoded.reply_to(), envelope.reply_to());
        prop_assert_eq!(decoded.ttl(), envelope.ttl());
        prop_assert_eq!(decoded.max_retries(), envelope.max_retries());
        prop_assert_eq!(decoded.payload(), envelope.payload());
        prop_assert_eq!(
            decoded.timestamp().timestamp_micros(),
            envelope.timestamp().timestamp_micros()
        );
    }

    #[test]
    fn every_wire_field_is_present(envelope in envelope_strategy()) {
        let fields = envelope.to_wire_fields().unwrap();
        for name in [
            "id", "type", "priority", "source", "target", "timestamp", "data",
            "correlation_id", "reply_to", "ttl", "retries", "max_retries",
        ] {
            prop_assert!(fields.contains_key(name), "missing {}", name);
        }
    }

    #[test]
    fn replies_keep_correlation_and_return_to_sender(envelope in envelope_strategy()) {
        let reply = envelope.reply(
            "responder",
            agentbus_core::messaging::MessageKind::TaskResponse,
            Default::default(),
        );
        let expected = envelope.correlation_id().unwrap_or(envelope.id());
        prop_assert_eq!(reply.correlation_id(), Some(expected));
        prop_assert_eq!(reply.target(), Some(envelope.source()));
        prop_assert_ne!(reply.id(), envelope.id());
    }

    #[test]
    fn protocol_header_is_stripped_on_decode(
        payload in payload_strategy().prop_map(|mut p| {
            p.remove(PROTOCOL_HEADER_KEY);
            p
        })
    ) {
        let message = ProtocolMessage::new(ProtocolAction::Publish, "publisher", payload.clone())
            .with_metadata("topic", "alerts");
        let envelope = message.to_envelope().unwrap();
        prop_assert!(envelope.payload().contains_key(PROTOCOL_HEADER_KEY));

        let decoded = ProtocolMessage::from_envelope(envelope).unwrap();
        prop_assert_eq!(decoded.action, ProtocolAction::Publish);
        prop_assert_eq!(decoded.metadata_str("topic"), Some("alerts"));
        prop_assert_eq!(decoded.payload(), &payload);
    }

    #[test]
    fn worker_metrics_stay_consistent(results in task_results_strategy()) {
        let mut metrics = WorkerMetrics::default();
        let mut successful_total = 0.0;
        for result in &results {
            match result {
                Some(duration_ms) => {
                    metrics.record_success(*duration_ms);
                    successful_total += duration_ms;
                }
                None => metrics.record_failure("error"),
            }
        }

        prop_assert_eq!(metrics.tasks_processed, results.len() as u64);
        prop_assert_eq!(
            metrics.tasks_successful + metrics.tasks_failed,
            metrics.tasks_processed
        );
        prop_assert!((0.0..=1.0).contains(&metrics.error_rate));
        if metrics.tasks_successful > 0 {
            let expected = successful_total / metrics.tasks_successful as f64;
            prop_assert!((metrics.average_processing_time_ms - expected).abs() < 1e-6);
        } else {
            prop_assert_eq!(metrics.average_processing_time_ms, 0.0);
        }
        let failures: u64 = metrics.failure_types.values().sum();
        prop_assert_eq!(failures, metrics.tasks_failed);
    }
}
