//! # Protocol Handler
//!
//! Shared plumbing for the four protocols. A [`ProtocolContext`] owns everything a
//! protocol instance needs to talk to the bus: its agent id, the bus itself, the
//! middleware chain and counters. Protocols implement [`ProtocolHandler`] and are
//! bridged onto bus subscriptions with [`attach`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::errors::ProtocolResult;
use super::message::{CommunicationPattern, ProtocolMessage};
use super::middleware::{MessageDirection, MiddlewareChain};
use crate::messaging::{
    DeliveryOutcome, EntryId, EnvelopeHandler, MessageBus, MessageEnvelope, SubscribeOptions,
    SubscriptionId,
};

#[derive(Debug, Default)]
pub struct ProtocolStats {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    undecodable: AtomicU64,
    handler_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStatsSnapshot {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub rejected: u64,
    pub undecodable: u64,
    pub handler_errors: u64,
}

impl ProtocolStats {
    pub fn snapshot(&self) -> ProtocolStatsSnapshot {
        ProtocolStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-instance protocol state: identity, bus access, middleware and counters
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    agent_id: String,
    bus: Arc<MessageBus>,
    middleware: MiddlewareChain,
    stats: Arc<ProtocolStats>,
}

impl ProtocolContext {
    pub fn new(agent_id: impl Into<String>, bus: Arc<MessageBus>, middleware: MiddlewareChain) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            middleware,
            stats: Arc::new(ProtocolStats::default()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn stats(&self) -> ProtocolStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &Arc<ProtocolStats> {
        &self.stats
    }

    /// Run the outbound chain and publish.
    ///
    /// Returns `Ok(None)` when middleware rejected the message; nothing was sent.
    pub async fn send(
        &self,
        stream: &str,
        message: ProtocolMessage,
    ) -> ProtocolResult<Option<EntryId>> {
        let Some(message) = self.middleware.apply(message, MessageDirection::Outbound) else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let envelope = message.to_envelope()?;
        match self.bus.publish(stream, &envelope).await {
            Ok(entry_id) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry_id))
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Decode an envelope and run the inbound chain; `None` when it was dropped
    pub fn receive(&self, envelope: MessageEnvelope) -> Option<ProtocolMessage> {
        let message_id = envelope.id().to_string();
        let message = match ProtocolMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                self.stats.undecodable.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent_id = %self.agent_id,
                    message_id = %message_id,
                    error = %e,
                    "Dropping undecodable protocol message"
                );
                return None;
            }
        };

        match self.middleware.apply(message, MessageDirection::Inbound) {
            Some(message) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                Some(message)
            }
            None => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn pattern(&self) -> CommunicationPattern;

    fn context(&self) -> &ProtocolContext;

    /// Whether this handler wants the message; by default only its own pattern
    fn accepts(&self, message: &ProtocolMessage) -> bool {
        message.pattern == self.pattern()
    }

    /// Handle one inbound message, optionally producing a reply
    async fn handle_message(&self, message: ProtocolMessage)
        -> ProtocolResult<Option<ProtocolMessage>>;

    /// Decode, filter and handle an envelope, then publish any reply to `reply_to`
    async fn process_envelope(&self, envelope: MessageEnvelope) -> ProtocolResult<()> {
        let context = self.context();
        let Some(message) = context.receive(envelope) else {
            return Ok(());
        };

        if !self.accepts(&message) {
            debug!(
                agent_id = %context.agent_id(),
                pattern = %self.pattern(),
                action = %message.action,
                "Ignoring message for another protocol"
            );
            return Ok(());
        }

        let reply_to = message.envelope.reply_to().map(str::to_string);
        let message_id = message.id().to_string();
        let Some(reply) = self.handle_message(message).await? else {
            return Ok(());
        };

        match reply_to {
            Some(stream) => {
                context.send(&stream, reply).await?;
            }
            None => warn!(
                agent_id = %context.agent_id(),
                message_id = %message_id,
                action = %reply.action,
                "Reply produced for a message without reply_to, dropping it"
            ),
        }
        Ok(())
    }
}

/// Bus adapter for a protocol handler.
///
/// Holds the handler weakly so an active subscription never keeps a dropped
/// protocol alive. Transient failures are surfaced to the bus for redelivery;
/// everything else is logged and the entry acknowledged.
pub struct ProtocolEnvelopeHandler<H: ProtocolHandler> {
    handler: Weak<H>,
}

impl<H: ProtocolHandler> ProtocolEnvelopeHandler<H> {
    pub fn new(handler: &Arc<H>) -> Self {
        Self {
            handler: Arc::downgrade(handler),
        }
    }
}

#[async_trait]
impl<H: ProtocolHandler> EnvelopeHandler for ProtocolEnvelopeHandler<H> {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<DeliveryOutcome> {
        let Some(handler) = self.handler.upgrade() else {
            return Ok(DeliveryOutcome::Released);
        };

        match handler.process_envelope(envelope).await {
            Ok(()) => Ok(DeliveryOutcome::Handled),
            Err(e) if e.is_transient() => {
                handler.context().stats_handle().record_handler_error();
                Err(e.into())
            }
            Err(e) => {
                handler.context().stats_handle().record_handler_error();
                warn!(
                    agent_id = %handler.context().agent_id(),
                    pattern = %handler.pattern(),
                    error = %e,
                    "Protocol handler failed"
                );
                Ok(DeliveryOutcome::Handled)
            }
        }
    }
}

/// Subscribe a protocol handler to `stream` on its context's bus
pub async fn attach<H: ProtocolHandler>(
    handler: &Arc<H>,
    stream: &str,
    options: SubscribeOptions,
) -> ProtocolResult<SubscriptionId> {
    let adapter: Arc<dyn EnvelopeHandler> = Arc::new(ProtocolEnvelopeHandler::new(handler));
    let id = handler
        .context()
        .bus()
        .subscribe(stream, adapter, options)
        .await?;
    Ok(id)
}
