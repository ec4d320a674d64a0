//! # Message Envelope
//!
//! The immutable record exchanged over the bus, plus its flat wire encoding.
//!
//! Every entry appended to a log stream is a flat map of string fields:
//!
//! | field            | encoding                                  |
//! |------------------|-------------------------------------------|
//! | `id`             | UUID string                               |
//! | `type`           | snake_case kind (`task_request`, ...)     |
//! | `priority`       | ordinal (`1` low .. `4` critical)         |
//! | `source`         | producer address                          |
//! | `target`         | consumer address, empty for broadcast     |
//! | `timestamp`      | ISO-8601                                  |
//! | `data`           | JSON-encoded payload                      |
//! | `correlation_id` | empty when absent                         |
//! | `reply_to`       | empty when absent                         |
//! | `ttl`            | seconds, `0` when absent                  |
//! | `retries`        | integer                                   |
//! | `max_retries`    | integer                                   |
//!
//! Producers and consumers of different versions rely on this exact field set.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};

/// Opaque structured payload carried by an envelope
pub type Payload = Map<String, Value>;

/// Flat string field map used on the log stream
pub type WireFields = HashMap<String, String>;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Envelope kinds understood by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest,
    TaskResponse,
    TaskStatus,
    SystemEvent,
    HealthCheck,
    DomainAssessment,
    WorkflowTrigger,
    ErrorNotification,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::TaskStatus => "task_status",
            Self::SystemEvent => "system_event",
            Self::HealthCheck => "health_check",
            Self::DomainAssessment => "domain_assessment",
            Self::WorkflowTrigger => "workflow_trigger",
            Self::ErrorNotification => "error_notification",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_request" => Ok(Self::TaskRequest),
            "task_response" => Ok(Self::TaskResponse),
            "task_status" => Ok(Self::TaskStatus),
            "system_event" => Ok(Self::SystemEvent),
            "health_check" => Ok(Self::HealthCheck),
            "domain_assessment" => Ok(Self::DomainAssessment),
            "workflow_trigger" => Ok(Self::WorkflowTrigger),
            "error_notification" => Ok(Self::ErrorNotification),
            other => Err(MessagingError::decode(
                "type",
                format!("unknown message type: {other}"),
            )),
        }
    }
}

/// Advisory priority; the transport only guarantees per-stream FIFO order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl MessagePriority {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Immutable message record.
///
/// Identity is assigned at construction and never changes. Builder methods consume
/// the envelope and return the updated value, so a published envelope cannot be
/// altered in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    id: String,
    kind: MessageKind,
    priority: MessagePriority,
    source: String,
    target: Option<String>,
    timestamp: DateTime<Utc>,
    payload: Payload,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    ttl: Option<u64>,
    retries: u32,
    max_retries: u32,
}

impl MessageEnvelope {
    pub fn new(kind: MessageKind, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority: MessagePriority::Normal,
            source: source.into(),
            target: None,
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
            reply_to: None,
            ttl: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// A ttl of zero means the envelope never goes stale.
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl = (ttl_seconds > 0).then_some(ttl_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Same identity, different payload; used when framing layers add headers
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Copy carrying an updated redelivery counter
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Build a response to this envelope.
    ///
    /// The response keeps the request's correlation id (or the request id when the
    /// request carried none) and is addressed back to the request's source.
    pub fn reply(&self, source: impl Into<String>, kind: MessageKind, payload: Payload) -> Self {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        Self::new(kind, source, payload)
            .with_priority(self.priority)
            .with_target(self.source.clone())
            .with_correlation_id(correlation_id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn priority(&self) -> MessagePriority {
        self.priority
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// True on the final delivery attempt, or past it
    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Convenience lookup of a string field in the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX));
                self.timestamp
                    .checked_add_signed(ttl)
                    .is_some_and(|deadline| now >= deadline)
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True when the envelope is untargeted or targeted at `consumer`.
    pub fn is_addressed_to(&self, consumer: &str) -> bool {
        self.target.as_deref().map_or(true, |target| target == consumer)
    }

    pub fn to_wire_fields(&self) -> MessagingResult<WireFields> {
        let data = serde_json::to_string(&self.payload)?;
        let mut fields = WireFields::with_capacity(12);
        fields.insert("id".to_string(), self.id.clone());
        fields.insert("type".to_string(), self.kind.as_str().to_string());
        fields.insert("priority".to_string(), self.priority.ordinal().to_string());
        fields.insert("source".to_string(), self.source.clone());
        fields.insert(
            "target".to_string(),
            self.target.clone().unwrap_or_default(),
        );
        fields.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        fields.insert("data".to_string(), data);
        fields.insert(
            "correlation_id".to_string(),
            self.correlation_id.clone().unwrap_or_default(),
        );
        fields.insert(
            "reply_to".to_string(),
            self.reply_to.clone().unwrap_or_default(),
        );
        fields.insert("ttl".to_string(), self.ttl.unwrap_or(0).to_string());
        fields.insert("retries".to_string(), self.retries.to_string());
        fields.insert("max_retries".to_string(), self.max_retries.to_string());
        Ok(fields)
    }

    pub fn from_wire_fields(fields: &WireFields) -> MessagingResult<Self> {
        let id = required(fields, "id")?;
        if id.is_empty() {
            return Err(MessagingError::decode("id", "empty message id"));
        }

        let kind = required(fields, "type")?.parse::<MessageKind>()?;

        let priority = optional(fields, "priority")
            .map(|raw| {
                raw.parse::<u8>()
                    .ok()
                    .and_then(MessagePriority::from_ordinal)
                    .ok_or_else(|| {
                        MessagingError::decode("priority", format!("invalid ordinal: {raw}"))
                    })
            })
            .transpose()?
            .unwrap_or_default();

        let timestamp = parse_timestamp(required(fields, "timestamp")?)?;

        let payload = match optional(fields, "data") {
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(Value::Null) => Payload::new(),
                Ok(other) => {
                    return Err(MessagingError::decode(
                        "data",
                        format!("expected a JSON object, got {other}"),
                    ))
                }
                Err(e) => return Err(MessagingError::decode("data", e.to_string())),
            },
            None => Payload::new(),
        };

        let ttl = parse_number::<u64>(fields, "ttl")?.filter(|ttl| *ttl > 0);
        let retries = parse_number::<u32>(fields, "retries")?.unwrap_or(0);
        let max_retries =
            parse_number::<u32>(fields, "max_retries")?.unwrap_or(DEFAULT_MAX_RETRIES);

        Ok(Self {
            id: id.to_string(),
            kind,
            priority,
            source: required(fields, "source")?.to_string(),
            target: optional(fields, "target").map(str::to_string),
            timestamp,
            payload,
            correlation_id: optional(fields, "correlation_id").map(str::to_string),
            reply_to: optional(fields, "reply_to").map(str::to_string),
            ttl,
            retries,
            max_retries,
        })
    }
}

fn required<'a>(fields: &'a WireFields, name: &str) -> MessagingResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| MessagingError::decode(name, "missing field"))
}

/// Empty strings encode absent values.
fn optional<'a>(fields: &'a WireFields, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_number<T: FromStr>(fields: &WireFields, name: &str) -> MessagingResult<Option<T>> {
    optional(fields, name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| MessagingError::decode(name, format!("not a number: {raw}")))
        })
        .transpose()
}

/// Accepts RFC 3339 and offset-less ISO-8601 (interpreted as UTC).
fn parse_timestamp(raw: &str) -> MessagingResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| MessagingError::decode("timestamp", format!("{raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_wire_field_set_is_exact() {
        let envelope = MessageEnvelope::new(
            MessageKind::TaskRequest,
            "supervisor",
            payload(json!({"task_type": "x"})),
        )
        .with_target("worker-1")
        .with_correlation_id("t1");

        let fields = envelope.to_wire_fields().unwrap();
        let mut keys: Vec<_> = fields.keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "correlation_id",
                "data",
                "id",
                "max_retries",
                "priority",
                "reply_to",
                "retries",
                "source",
                "target",
                "timestamp",
                "ttl",
                "type"
            ]
        );
        assert_eq!(fields["type"], "task_request");
        assert_eq!(fields["priority"], "2");
        assert_eq!(fields["reply_to"], "");
        assert_eq!(fields["ttl"], "0");
    }

    #[test]
    fn test_absent_optionals_decode_to_none() {
        let envelope =
            MessageEnvelope::new(MessageKind::SystemEvent, "worker-a", Payload::new());
        let decoded =
            MessageEnvelope::from_wire_fields(&envelope.to_wire_fields().unwrap()).unwrap();

        assert_eq!(decoded.target(), None);
        assert_eq!(decoded.correlation_id(), None);
        assert_eq!(decoded.reply_to(), None);
        assert_eq!(decoded.ttl(), None);
        assert_eq!(decoded.id(), envelope.id());
    }

    #[test]
    fn test_naive_timestamp_is_accepted_as_utc() {
        let mut fields = MessageEnvelope::new(MessageKind::HealthCheck, "w", Payload::new())
            .to_wire_fields()
            .unwrap();
        fields.insert(
            "timestamp".to_string(),
            "2024-03-01T12:30:45.123456".to_string(),
        );

        let decoded = MessageEnvelope::from_wire_fields(&fields).unwrap();
        assert_eq!(decoded.timestamp().to_rfc3339(), "2024-03-01T12:30:45.123456+00:00");
    }

    #[test]
    fn test_decode_errors_name_the_field() {
        let mut fields = MessageEnvelope::new(MessageKind::TaskStatus, "w", Payload::new())
            .to_wire_fields()
            .unwrap();
        fields.insert("priority".to_string(), "9".to_string());
        let err = MessageEnvelope::from_wire_fields(&fields).unwrap_err();
        assert!(matches!(err, MessagingError::Decode { ref field, .. } if field == "priority"));

        fields.insert("priority".to_string(), "1".to_string());
        fields.insert("data".to_string(), "[1, 2]".to_string());
        let err = MessageEnvelope::from_wire_fields(&fields).unwrap_err();
        assert!(matches!(err, MessagingError::Decode { ref field, .. } if field == "data"));

        fields.remove("type");
        let err = MessageEnvelope::from_wire_fields(&fields).unwrap_err();
        assert!(matches!(err, MessagingError::Decode { ref field, .. } if field == "type"));
    }

    #[test]
    fn test_reply_keeps_correlation_and_addresses_source() {
        let request = MessageEnvelope::new(MessageKind::TaskRequest, "supervisor", Payload::new())
            .with_correlation_id("t1")
            .with_priority(MessagePriority::High);
        let response = request.reply("worker-1", MessageKind::TaskResponse, Payload::new());

        assert_eq!(response.correlation_id(), Some("t1"));
        assert_eq!(response.target(), Some("supervisor"));
        assert_eq!(response.priority(), MessagePriority::High);
        assert_ne!(response.id(), request.id());

        let uncorrelated = MessageEnvelope::new(MessageKind::TaskRequest, "s", Payload::new());
        let response = uncorrelated.reply("w", MessageKind::TaskResponse, Payload::new());
        assert_eq!(response.correlation_id(), Some(uncorrelated.id()));
    }

    #[test]
    fn test_ttl_expiry() {
        let envelope =
            MessageEnvelope::new(MessageKind::SystemEvent, "s", Payload::new()).with_ttl(10);
        let created = envelope.timestamp();
        assert!(!envelope.is_expired_at(created + chrono::Duration::seconds(9)));
        assert!(envelope.is_expired_at(created + chrono::Duration::seconds(10)));

        let forever = MessageEnvelope::new(MessageKind::SystemEvent, "s", Payload::new()).with_ttl(0);
        assert_eq!(forever.ttl(), None);
        assert!(!forever.is_expired_at(created + chrono::Duration::days(365)));
    }

    #[test]
    fn test_addressing() {
        let broadcast = MessageEnvelope::new(MessageKind::SystemEvent, "s", Payload::new());
        assert!(broadcast.is_addressed_to("worker-1"));

        let targeted = broadcast.clone().with_target("worker-1");
        assert!(targeted.is_addressed_to("worker-1"));
        assert!(!targeted.is_addressed_to("worker-2"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::Low < MessagePriority::Normal);
        assert_eq!(MessagePriority::from_ordinal(0), None);
    }
}
