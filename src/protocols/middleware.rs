//! # Protocol Middleware
//!
//! An ordered chain applied to every message crossing the protocol boundary. Each
//! stage may rewrite the message or reject it; a rejection stops the chain for that
//! message and is reported as a warning by [`MiddlewareChain::apply`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::message::{ProtocolAction, ProtocolMessage};
use crate::config::ProtocolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareRejection {
    pub middleware: String,
    pub reason: String,
}

impl MiddlewareRejection {
    pub fn new(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }
}

pub trait ProtocolMiddleware: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        message: ProtocolMessage,
        direction: MessageDirection,
    ) -> Result<ProtocolMessage, MiddlewareRejection>;
}

/// Debug-level trace of every message
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl ProtocolMiddleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn process(
        &self,
        message: ProtocolMessage,
        direction: MessageDirection,
    ) -> Result<ProtocolMessage, MiddlewareRejection> {
        debug!(
            direction = %direction,
            message_id = %message.id(),
            pattern = %message.pattern,
            action = %message.action,
            source = %message.source(),
            target = message.envelope.target().unwrap_or("-"),
            correlation_id = message.correlation_id().unwrap_or("-"),
            "Protocol message"
        );
        Ok(message)
    }
}

/// Stamps `outbound_at` when sending, `inbound_at` and `transit_ms` when receiving
#[derive(Debug, Default)]
pub struct TimingMiddleware;

impl ProtocolMiddleware for TimingMiddleware {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn process(
        &self,
        mut message: ProtocolMessage,
        direction: MessageDirection,
    ) -> Result<ProtocolMessage, MiddlewareRejection> {
        let now = Utc::now();
        match direction {
            MessageDirection::Outbound => {
                message
                    .metadata
                    .insert("outbound_at".to_string(), json!(now.to_rfc3339()));
            }
            MessageDirection::Inbound => {
                message
                    .metadata
                    .insert("inbound_at".to_string(), json!(now.to_rfc3339()));
                let sent = message
                    .metadata_str("outbound_at")
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|| message.envelope.timestamp());
                let transit_ms = (now - sent).num_milliseconds().max(0);
                message
                    .metadata
                    .insert("transit_ms".to_string(), json!(transit_ms));
            }
        }
        Ok(message)
    }
}

/// Structural checks that every protocol relies on
#[derive(Debug, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    fn reject(&self, reason: impl Into<String>) -> Result<ProtocolMessage, MiddlewareRejection> {
        Err(MiddlewareRejection::new(self.name(), reason))
    }
}

impl ProtocolMiddleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn process(
        &self,
        message: ProtocolMessage,
        direction: MessageDirection,
    ) -> Result<ProtocolMessage, MiddlewareRejection> {
        if message.id().trim().is_empty() {
            return self.reject("message id is empty");
        }
        if message.source().trim().is_empty() {
            return self.reject("message source is empty");
        }
        if message.pattern != message.action.pattern() {
            return self.reject(format!(
                "action {} does not belong to pattern {}",
                message.action, message.pattern
            ));
        }
        if message.action.is_reply() && message.correlation_id().is_none() {
            return self.reject(format!("{} requires a correlation id", message.action));
        }
        if message.action == ProtocolAction::Request && message.envelope.reply_to().is_none() {
            return self.reject("request requires a reply_to stream");
        }
        if message.action == ProtocolAction::TaskAssignment && message.envelope.target().is_none()
        {
            return self.reject("task assignment requires a target worker");
        }
        if direction == MessageDirection::Inbound && message.envelope.is_expired() {
            return self.reject("message ttl expired");
        }
        Ok(message)
    }
}

/// Ordered middleware stages plus a rejection counter
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn ProtocolMiddleware>>,
    rejected: Arc<AtomicU64>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("stages", &self.stage_names())
            .field("rejected", &self.rejected())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in stages enabled by configuration: validation, timing, logging
    pub fn from_config(config: &ProtocolConfig) -> Self {
        let mut chain = Self::new();
        if config.enable_validation {
            chain = chain.with(ValidationMiddleware);
        }
        if config.enable_timing {
            chain = chain.with(TimingMiddleware);
        }
        if config.enable_logging {
            chain = chain.with(LoggingMiddleware);
        }
        chain
    }

    pub fn with(mut self, middleware: impl ProtocolMiddleware) -> Self {
        self.stages.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn ProtocolMiddleware>) {
        self.stages.push(middleware);
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Run every stage in order; `None` when one of them rejected the message
    pub fn apply(
        &self,
        message: ProtocolMessage,
        direction: MessageDirection,
    ) -> Option<ProtocolMessage> {
        let message_id = message.id().to_string();
        let mut current = message;
        for stage in &self.stages {
            match stage.process(current, direction) {
                Ok(next) => current = next,
                Err(rejection) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        direction = %direction,
                        message_id = %message_id,
                        middleware = %rejection.middleware,
                        reason = %rejection.reason,
                        "Protocol message rejected by middleware"
                    );
                    return None;
                }
            }
        }
        Some(current)
    }
}
