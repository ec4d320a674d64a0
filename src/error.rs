//! Error types for the agent bus.
//!
//! Each layer owns a `thiserror` enum (`MessagingError`, `ProtocolError`,
//! `WorkerError`, `ConfigurationError`); [`AgentBusError`] wraps them for callers
//! that drive several layers at once, such as the worker binary.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::protocols::ProtocolError;
use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum AgentBusError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentBusResult<T> = Result<T, AgentBusError>;
