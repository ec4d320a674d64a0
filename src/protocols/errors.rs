use thiserror::Error;

use super::message::{CommunicationPattern, ProtocolAction};
use crate::messaging::MessagingError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Invalid protocol message: {0}")]
    InvalidMessage(String),

    #[error("Message rejected by {middleware} middleware: {reason}")]
    Rejected { middleware: String, reason: String },

    #[error("{pattern} protocol does not handle {action} messages")]
    UnsupportedAction {
        pattern: CommunicationPattern,
        action: ProtocolAction,
    },

    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Internal protocol error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage(reason.into())
    }

    pub fn rejected(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(pattern: CommunicationPattern, action: ProtocolAction) -> Self {
        Self::UnsupportedAction { pattern, action }
    }

    pub fn request_timeout(correlation_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            correlation_id: correlation_id.into(),
            timeout_ms,
        }
    }

    /// Whether redelivering the inbound message could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Messaging(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
