//! # Protocol Messages
//!
//! A [`ProtocolMessage`] is a bus envelope plus the protocol it belongs to, the
//! action it performs and free-form metadata. On the wire the header travels in
//! the envelope payload under the `protocol` key, so plain bus consumers still see
//! a regular envelope. Envelopes published without a header (for example task
//! responses from worker agents) are classified from their [`MessageKind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{ProtocolError, ProtocolResult};
use crate::messaging::{MessageEnvelope, MessageKind, Payload};

/// Payload key carrying the protocol header
pub const PROTOCOL_HEADER_KEY: &str = "protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationPattern {
    RequestResponse,
    PublishSubscribe,
    TaskCoordination,
    HealthMonitoring,
}

impl fmt::Display for CommunicationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestResponse => write!(f, "request_response"),
            Self::PublishSubscribe => write!(f, "publish_subscribe"),
            Self::TaskCoordination => write!(f, "task_coordination"),
            Self::HealthMonitoring => write!(f, "health_monitoring"),
        }
    }
}

/// Every message type the protocol layer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolAction {
    Request,
    Response,
    Publish,
    TaskAssignment,
    TaskProgress,
    TaskCompletion,
    TaskAcknowledgment,
    Heartbeat,
    HealthCheckRequest,
    HealthCheckResponse,
}

impl ProtocolAction {
    pub fn pattern(self) -> CommunicationPattern {
        match self {
            Self::Request | Self::Response => CommunicationPattern::RequestResponse,
            Self::Publish => CommunicationPattern::PublishSubscribe,
            Self::TaskAssignment
            | Self::TaskProgress
            | Self::TaskCompletion
            | Self::TaskAcknowledgment => CommunicationPattern::TaskCoordination,
            Self::Heartbeat | Self::HealthCheckRequest | Self::HealthCheckResponse => {
                CommunicationPattern::HealthMonitoring
            }
        }
    }

    /// Envelope kind used when a message of this action is published
    pub fn default_kind(self) -> MessageKind {
        match self {
            Self::Request | Self::TaskAssignment => MessageKind::TaskRequest,
            Self::Response | Self::TaskCompletion => MessageKind::TaskResponse,
            Self::TaskProgress | Self::TaskAcknowledgment => MessageKind::TaskStatus,
            Self::Publish => MessageKind::SystemEvent,
            Self::Heartbeat | Self::HealthCheckRequest | Self::HealthCheckResponse => {
                MessageKind::HealthCheck
            }
        }
    }

    /// Actions that answer an earlier message and so need its correlation id
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Self::Response
                | Self::TaskProgress
                | Self::TaskCompletion
                | Self::TaskAcknowledgment
                | Self::HealthCheckResponse
        )
    }

    /// Classification for envelopes that carry no protocol header
    pub fn infer(kind: MessageKind) -> Self {
        match kind {
            MessageKind::TaskRequest => Self::TaskAssignment,
            MessageKind::TaskResponse => Self::TaskCompletion,
            MessageKind::TaskStatus => Self::TaskProgress,
            MessageKind::HealthCheck => Self::Heartbeat,
            MessageKind::SystemEvent
            | MessageKind::DomainAssessment
            | MessageKind::WorkflowTrigger
            | MessageKind::ErrorNotification => Self::Publish,
        }
    }
}

impl fmt::Display for ProtocolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Publish => "publish",
            Self::TaskAssignment => "task_assignment",
            Self::TaskProgress => "task_progress",
            Self::TaskCompletion => "task_completion",
            Self::TaskAcknowledgment => "task_acknowledgment",
            Self::Heartbeat => "heartbeat",
            Self::HealthCheckRequest => "health_check_request",
            Self::HealthCheckResponse => "health_check_response",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProtocolHeader {
    pattern: CommunicationPattern,
    action: ProtocolAction,
    #[serde(default)]
    metadata: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub envelope: MessageEnvelope,
    pub pattern: CommunicationPattern,
    pub action: ProtocolAction,
    pub metadata: Payload,
}

impl ProtocolMessage {
    pub fn new(action: ProtocolAction, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            envelope: MessageEnvelope::new(action.default_kind(), source, payload),
            pattern: action.pattern(),
            action,
            metadata: Payload::new(),
        }
    }

    pub fn from_parts(envelope: MessageEnvelope, action: ProtocolAction) -> Self {
        Self {
            envelope,
            pattern: action.pattern(),
            action,
            metadata: Payload::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.envelope = self.envelope.with_target(target);
        self
    }

    pub fn with_correlation(
        mut self,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        self.envelope = self
            .envelope
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.envelope = self.envelope.with_correlation_id(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.envelope = self.envelope.with_reply_to(reply_to);
        self
    }

    pub fn id(&self) -> &str {
        self.envelope.id()
    }

    pub fn source(&self) -> &str {
        self.envelope.source()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id()
    }

    pub fn payload(&self) -> &Payload {
        self.envelope.payload()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Answer this message: same pattern and correlation, addressed to the sender
    pub fn reply(&self, source: impl Into<String>, action: ProtocolAction, payload: Payload) -> Self {
        Self {
            envelope: self.envelope.reply(source, action.default_kind(), payload),
            pattern: action.pattern(),
            action,
            metadata: Payload::new(),
        }
    }

    /// Embed the protocol header into the payload for publishing
    pub fn to_envelope(&self) -> ProtocolResult<MessageEnvelope> {
        let header = ProtocolHeader {
            pattern: self.pattern,
            action: self.action,
            metadata: self.metadata.clone(),
        };
        let header = serde_json::to_value(header)
            .map_err(|e| ProtocolError::invalid_message(format!("header encoding: {e}")))?;

        let mut payload = self.envelope.payload().clone();
        payload.insert(PROTOCOL_HEADER_KEY.to_string(), header);
        Ok(self.envelope.clone().with_payload(payload))
    }

    /// Split the protocol header back out of an envelope, or classify a plain one
    pub fn from_envelope(envelope: MessageEnvelope) -> ProtocolResult<Self> {
        let mut payload = envelope.payload().clone();
        match payload.remove(PROTOCOL_HEADER_KEY) {
            Some(raw) => {
                let header: ProtocolHeader = serde_json::from_value(raw).map_err(|e| {
                    ProtocolError::invalid_message(format!("malformed protocol header: {e}"))
                })?;
                Ok(Self {
                    envelope: envelope.with_payload(payload),
                    pattern: header.pattern,
                    action: header.action,
                    metadata: header.metadata,
                })
            }
            None => {
                let action = ProtocolAction::infer(envelope.kind());
                Ok(Self::from_parts(envelope, action))
            }
        }
    }
}
