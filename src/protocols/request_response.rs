//! # Request/Response Protocol
//!
//! Correlated request/reply at the protocol layer. Outstanding requests live in a
//! `correlation_id -> oneshot` map owned by the protocol instance. A response
//! whose id is no longer pending (the caller already timed out) is counted and
//! dropped, so it can never resolve a later request.
//!
//! Responses arrive on `<stream>:responses` through a private consumer group named
//! after the agent, created lazily on the first request to `stream`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{ProtocolError, ProtocolResult};
use super::handler::{attach, ProtocolContext, ProtocolHandler};
use super::message::{CommunicationPattern, ProtocolAction, ProtocolMessage};
use crate::constants::response_stream;
use crate::messaging::{ForeignTargetPolicy, GroupStart, Payload, SubscribeOptions, SubscriptionId};

/// Serves inbound requests; the returned payload becomes the response body
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, request: &ProtocolMessage) -> anyhow::Result<Payload>;
}

/// Removes the pending entry however the waiting future ends
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<ProtocolMessage>>,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct RequestResponseProtocol {
    context: ProtocolContext,
    pending: DashMap<String, oneshot::Sender<ProtocolMessage>>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    /// stream -> subscription, for both response listeners and served streams
    subscriptions: Mutex<HashMap<String, SubscriptionId>>,
    late_responses: AtomicU64,
    served: AtomicU64,
}

impl std::fmt::Debug for RequestResponseProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseProtocol")
            .field("agent_id", &self.context.agent_id())
            .field("pending", &self.pending.len())
            .field("serving", &self.request_handler.is_some())
            .finish()
    }
}

impl RequestResponseProtocol {
    pub fn new(context: ProtocolContext) -> Self {
        Self {
            context,
            pending: DashMap::new(),
            request_handler: None,
            subscriptions: Mutex::new(HashMap::new()),
            late_responses: AtomicU64::new(0),
            served: AtomicU64::new(0),
        }
    }

    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handler = Some(handler);
        self
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Responses that arrived after their request was resolved or timed out
    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Consume requests from `stream` as a member of the competing `group`
    pub async fn serve(self: &Arc<Self>, stream: &str, group: &str) -> ProtocolResult<SubscriptionId> {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(id) = subscriptions.get(stream) {
            return Ok(id.clone());
        }
        let id = attach(
            self,
            stream,
            SubscribeOptions::new()
                .with_group(group)
                .with_consumer(self.context.agent_id()),
        )
        .await?;
        info!(agent_id = %self.context.agent_id(), stream = %stream, group = %group, "Serving requests");
        subscriptions.insert(stream.to_string(), id.clone());
        Ok(id)
    }

    async fn ensure_response_listener(self: &Arc<Self>, stream: &str) -> ProtocolResult<()> {
        let reply_stream = response_stream(stream);
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&reply_stream) {
            return Ok(());
        }
        let agent_id = self.context.agent_id().to_string();
        let id = attach(
            self,
            &reply_stream,
            SubscribeOptions::new()
                .with_group(agent_id.clone())
                .with_consumer(agent_id.clone())
                .starting_at(GroupStart::Latest)
                .with_target_filter(agent_id, ForeignTargetPolicy::Discard)
                .temporary(),
        )
        .await?;
        subscriptions.insert(reply_stream, id);
        Ok(())
    }

    /// Publish a request carrying `payload` to `stream` and wait for its response
    pub async fn send_request(
        self: &Arc<Self>,
        stream: &str,
        payload: Payload,
        timeout: Duration,
    ) -> ProtocolResult<ProtocolMessage> {
        self.ensure_response_listener(stream).await?;

        let correlation_id = Uuid::new_v4().to_string();
        let request =
            ProtocolMessage::new(ProtocolAction::Request, self.context.agent_id(), payload)
                .with_correlation(correlation_id.clone(), response_stream(stream));

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        if self.context.send(stream, request).await?.is_none() {
            return Err(ProtocolError::rejected(
                "outbound",
                "request rejected by middleware",
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                debug!(correlation_id = %correlation_id, stream = %stream, "Request resolved");
                Ok(response)
            }
            Ok(Err(_)) => Err(ProtocolError::Internal(format!(
                "request {correlation_id} abandoned before a response arrived"
            ))),
            Err(_) => {
                warn!(correlation_id = %correlation_id, stream = %stream, "Request timed out");
                Err(ProtocolError::request_timeout(
                    correlation_id,
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Stop listening and serving; outstanding requests fail immediately
    pub async fn close(&self) {
        let subscriptions: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in subscriptions {
            self.context.bus().unsubscribe(&id).await;
        }
        self.pending.clear();
    }

    async fn serve_request(&self, request: ProtocolMessage) -> ProtocolResult<Option<ProtocolMessage>> {
        let Some(handler) = self.request_handler.as_ref() else {
            return Err(ProtocolError::unsupported(
                CommunicationPattern::RequestResponse,
                ProtocolAction::Request,
            ));
        };

        let body = match handler.handle_request(&request).await {
            Ok(mut body) => {
                body.entry("success").or_insert(Value::Bool(true));
                body
            }
            Err(e) => {
                warn!(
                    agent_id = %self.context.agent_id(),
                    correlation_id = request.correlation_id().unwrap_or("-"),
                    error = %e,
                    "Request handler failed"
                );
                let mut body = Payload::new();
                body.insert("success".to_string(), json!(false));
                body.insert("error".to_string(), json!(e.to_string()));
                body
            }
        };
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(Some(request.reply(
            self.context.agent_id(),
            ProtocolAction::Response,
            body,
        )))
    }
}

#[async_trait]
impl ProtocolHandler for RequestResponseProtocol {
    fn pattern(&self) -> CommunicationPattern {
        CommunicationPattern::RequestResponse
    }

    fn context(&self) -> &ProtocolContext {
        &self.context
    }

    /// Replies on response streams may be plain envelopes of any kind
    fn accepts(&self, _message: &ProtocolMessage) -> bool {
        true
    }

    async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> ProtocolResult<Option<ProtocolMessage>> {
        if message.action == ProtocolAction::Request {
            return self.serve_request(message).await;
        }

        let Some(correlation_id) = message.correlation_id().map(str::to_string) else {
            return Err(ProtocolError::invalid_message(
                "response without correlation id",
            ));
        };

        match self.pending.remove(&correlation_id) {
            Some((_, tx)) => {
                if tx.send(message).is_err() {
                    self.late_responses.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    agent_id = %self.context.agent_id(),
                    correlation_id = %correlation_id,
                    "Dropping response with no pending request"
                );
            }
        }
        Ok(None)
    }
}
