//! # System Constants
//!
//! Stream names, consumer-group defaults and event names shared by producers and
//! consumers. Stream names are part of the wire contract with other processes and
//! must not change.

/// Well-known log streams
pub mod streams {
    /// Task assignments published by the supervisor
    pub const SUPERVISOR_TASKS: &str = "supervisor:tasks";
    /// Task responses and progress reported back to the supervisor
    pub const SUPERVISOR_RESPONSES: &str = "supervisor:responses";
    /// Lifecycle and control events (registration, shutdown, health requests)
    pub const SYSTEM_EVENTS: &str = "system:events";
    /// Heartbeats and health reports
    pub const HEALTH_CHECKS: &str = "health:checks";

    pub const PUBSUB_PREFIX: &str = "pubsub:";
    pub const RESPONSES_SUFFIX: &str = ":responses";
}

/// Consumer-group defaults
pub mod groups {
    pub const DEFAULT_GROUP: &str = "agentbus";
    pub const DEFAULT_CONSUMER: &str = "consumer";
    /// Shared group through which workers compete for tasks
    pub const WORKERS: &str = "workers";
}

/// Names carried in the `event` field of system-event payloads
pub mod system_events {
    pub const WORKER_REGISTERED: &str = "worker_registered";
    pub const WORKER_SHUTDOWN: &str = "worker_shutdown";
    pub const HEALTH_CHECK_REQUEST: &str = "health_check_request";
    pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
}

/// Response stream paired with a request stream
pub fn response_stream(stream: &str) -> String {
    format!("{stream}{}", streams::RESPONSES_SUFFIX)
}

/// Stream backing a publish/subscribe topic
pub fn pubsub_stream(topic: &str) -> String {
    format!("{}{topic}", streams::PUBSUB_PREFIX)
}
