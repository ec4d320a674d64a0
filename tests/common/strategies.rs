//! Proptest strategies for envelopes and worker outcomes.

use proptest::prelude::*;
use serde_json::{json, Value};

use agentbus_core::messaging::{MessageEnvelope, MessageKind, MessagePriority, Payload};

pub fn message_kind_strategy() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::TaskRequest),
        Just(MessageKind::TaskResponse),
        Just(MessageKind::TaskStatus),
        Just(MessageKind::HealthCheck),
        Just(MessageKind::SystemEvent),
        Just(MessageKind::DomainAssessment),
        Just(MessageKind::WorkflowTrigger),
        Just(MessageKind::ErrorNotification),
    ]
}

pub fn priority_strategy() -> impl Strategy<Value = MessagePriority> {
    prop_oneof![
        Just(MessagePriority::Low),
        Just(MessagePriority::Normal),
        Just(MessagePriority::High),
        Just(MessagePriority::Critical),
    ]
}

pub fn agent_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,15}"
}

fn json_leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,24}".prop_map(Value::String),
    ]
}

pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    let value = json_leaf_strategy().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    });
    prop::collection::btree_map("[a-z_]{1,10}", value, 0..6)
        .prop_map(|m| m.into_iter().collect())
}

prop_compose! {
    pub fn envelope_strategy()(
        kind in message_kind_strategy(),
        priority in priority_strategy(),
        source in agent_name_strategy(),
        target in proptest::option::of(agent_name_strategy()),
        correlation_id in proptest::option::of("[a-f0-9]{8}"),
        reply_to in proptest::option::of("[a-z]{3,8}:responses"),
        ttl in 0u64..10_000,
        max_retries in 0u32..10,
        payload in payload_strategy(),
    ) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::new(kind, source, payload)
            .with_priority(priority)
            .with_ttl(ttl)
            .with_max_retries(max_retries);
        if let Some(target) = target {
            envelope = envelope.with_target(target);
        }
        if let Some(correlation_id) = correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = reply_to {
            envelope = envelope.with_reply_to(reply_to);
        }
        envelope
    }
}

/// Sequence of task results: `Some(duration_ms)` for success, `None` for failure
pub fn task_results_strategy() -> impl Strategy<Value = Vec<Option<f64>>> {
    prop::collection::vec(proptest::option::of(0.0f64..5_000.0), 0..64)
}
