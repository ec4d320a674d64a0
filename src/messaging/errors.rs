//! # Messaging Error Types
//!
//! Structured errors for the log stream transport and the message bus.

use thiserror::Error;

/// Messaging error types shared by transports and the bus
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Transport connection error: {message}")]
    Connection { message: String },

    #[error("Stream operation failed: {stream}: {operation}: {message}")]
    StreamOperation {
        stream: String,
        operation: String,
        message: String,
    },

    #[error("Consumer group already exists: {stream}/{group}")]
    ConsumerGroupExists { stream: String, group: String },

    #[error("Consumer group not found: {stream}/{group}")]
    ConsumerGroupNotFound { stream: String, group: String },

    #[error("Message not delivered to {stream}: {message}")]
    Delivery { stream: String, message: String },

    #[error("Message encoding error: {message}")]
    Encode { message: String },

    #[error("Message decoding error: field '{field}': {message}")]
    Decode { field: String, message: String },

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Subscription not found: {subscription_id}")]
    SubscriptionNotFound { subscription_id: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a stream operation error
    pub fn stream_operation(
        stream: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StreamOperation {
            stream: stream.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn group_exists(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self::ConsumerGroupExists {
            stream: stream.into(),
            group: group.into(),
        }
    }

    pub fn group_not_found(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self::ConsumerGroupNotFound {
            stream: stream.into(),
            group: group.into(),
        }
    }

    /// Create a delivery error; the message must be treated as not delivered
    pub fn delivery(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            stream: stream.into(),
            message: message.into(),
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    pub fn decode(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn subscription_not_found(subscription_id: impl Into<String>) -> Self {
        Self::SubscriptionNotFound {
            subscription_id: subscription_id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::StreamOperation { .. }
                | Self::Delivery { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(error: serde_json::Error) -> Self {
        Self::encode(error.to_string())
    }
}

#[cfg(feature = "redis-streams")]
impl From<redis::RedisError> for MessagingError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_dropped() || error.is_connection_refusal() || error.is_timeout() {
            Self::connection(error.to_string())
        } else {
            Self::internal(error.to_string())
        }
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
