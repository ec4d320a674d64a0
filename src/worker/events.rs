use serde_json::{json, Value};

use crate::constants::system_events;
use crate::messaging::{MessageEnvelope, MessageKind, Payload};

/// Payload key naming the event on `system:events`
pub const EVENT_KEY: &str = "event";

/// Events exchanged on the system event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    WorkerRegistered,
    WorkerShutdown,
    HealthCheckRequest,
    ShutdownRequest,
    Other(String),
}

impl SystemEvent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkerRegistered => system_events::WORKER_REGISTERED,
            Self::WorkerShutdown => system_events::WORKER_SHUTDOWN,
            Self::HealthCheckRequest => system_events::HEALTH_CHECK_REQUEST,
            Self::ShutdownRequest => system_events::SHUTDOWN_REQUEST,
            Self::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            system_events::WORKER_REGISTERED => Self::WorkerRegistered,
            system_events::WORKER_SHUTDOWN => Self::WorkerShutdown,
            system_events::HEALTH_CHECK_REQUEST => Self::HealthCheckRequest,
            system_events::SHUTDOWN_REQUEST => Self::ShutdownRequest,
            other => Self::Other(other.to_string()),
        }
    }

    /// `None` for envelopes without an event name
    pub fn from_envelope(envelope: &MessageEnvelope) -> Option<Self> {
        envelope.payload_str(EVENT_KEY).map(Self::parse)
    }

    /// A system-event envelope carrying this event plus `details`
    pub fn to_envelope(&self, source: &str, mut details: Payload) -> MessageEnvelope {
        details.insert(EVENT_KEY.to_string(), Value::String(self.as_str().to_string()));
        details
            .entry("timestamp")
            .or_insert_with(|| json!(chrono::Utc::now().to_rfc3339()));
        MessageEnvelope::new(MessageKind::SystemEvent, source, details)
    }
}
