//! # Protocol Layer
//!
//! Typed communication patterns on top of the message bus. Every protocol wraps
//! bus envelopes in a [`ProtocolMessage`], passes them through a
//! [`MiddlewareChain`] in both directions and keeps its registries (pending
//! requests, topic handlers, task records, agent health) on its own instance.
//!
//! - [`RequestResponseProtocol`]: correlated request/reply
//! - [`PublishSubscribeProtocol`]: topic fan-out
//! - [`TaskCoordinationProtocol`]: task assignment lifecycle
//! - [`HealthMonitoringProtocol`]: heartbeats and aggregate health

pub mod errors;
pub mod handler;
pub mod health_monitoring;
pub mod message;
pub mod middleware;
pub mod pubsub;
pub mod request_response;
pub mod task_coordination;

pub use errors::{ProtocolError, ProtocolResult};
pub use handler::{
    attach, ProtocolContext, ProtocolEnvelopeHandler, ProtocolHandler, ProtocolStats,
    ProtocolStatsSnapshot,
};
pub use health_monitoring::{
    AgentHealth, AgentHealthStatus, HealthMonitoringProtocol, HealthRecord, HealthReporter,
    SystemHealth,
};
pub use message::{CommunicationPattern, ProtocolAction, ProtocolMessage, PROTOCOL_HEADER_KEY};
pub use middleware::{
    LoggingMiddleware, MessageDirection, MiddlewareChain, MiddlewareRejection,
    ProtocolMiddleware, TimingMiddleware, ValidationMiddleware,
};
pub use pubsub::{topic_handler, PublishSubscribeProtocol, TopicHandler};
pub use request_response::{RequestHandler, RequestResponseProtocol};
pub use task_coordination::{
    CoordinationRole, TaskCoordinationProtocol, TaskRecord, TaskRecordStatus,
};
