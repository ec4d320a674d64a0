//! # Worker Runtime
//!
//! [`WorkerAgent`] hosts task-specific logic (a [`TaskProcessor`]) on the message
//! bus: it competes for tasks with other workers, enforces the one-task-at-a-time
//! busy invariant and task timeouts, reports outcomes and metrics, and emits
//! heartbeats and lifecycle events.

pub mod agent;
pub mod capability;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod processor;
pub mod state;

pub use agent::{WorkerAgent, WorkerHealthSnapshot, BUSY_ERROR};
pub use capability::WorkerCapability;
pub use errors::{WorkerError, WorkerResult};
pub use events::SystemEvent;
pub use metrics::WorkerMetrics;
pub use processor::{TaskOutcome, TaskProcessor};
pub use state::WorkerStatus;
