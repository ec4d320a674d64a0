//! # Publish/Subscribe Protocol
//!
//! Topic fan-out over `pubsub:<topic>` streams. Each protocol instance reads a
//! topic through its own consumer group, so every subscribed agent sees every
//! message, and runs all local handlers for the topic concurrently. A failing or
//! panicking handler is counted and logged without affecting its siblings.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::errors::{ProtocolError, ProtocolResult};
use super::handler::{attach, ProtocolContext, ProtocolHandler};
use super::message::{CommunicationPattern, ProtocolAction, ProtocolMessage};
use crate::constants::pubsub_stream;
use crate::messaging::{EntryId, GroupStart, Payload, SubscribeOptions, SubscriptionId};

const TOPIC_KEY: &str = "topic";

pub type TopicHandler =
    Arc<dyn Fn(ProtocolMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn topic_handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(ProtocolMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

pub struct PublishSubscribeProtocol {
    context: ProtocolContext,
    handlers: RwLock<HashMap<String, Vec<TopicHandler>>>,
    subscriptions: Mutex<HashMap<String, SubscriptionId>>,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

impl std::fmt::Debug for PublishSubscribeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishSubscribeProtocol")
            .field("agent_id", &self.context.agent_id())
            .field("topics", &self.topics())
            .finish()
    }
}

impl PublishSubscribeProtocol {
    pub fn new(context: ProtocolContext) -> Self {
        Self {
            context,
            handlers: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            dispatched: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.read().get(topic).map_or(0, Vec::len)
    }

    /// Handler invocations, successful or not
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Add `handler` to `topic`, starting the topic subscription on first use
    pub async fn subscribe(self: &Arc<Self>, topic: &str, handler: TopicHandler) -> ProtocolResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        self.handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);

        if subscriptions.contains_key(topic) {
            return Ok(());
        }

        let agent_id = self.context.agent_id().to_string();
        let subscribed = attach(
            self,
            &pubsub_stream(topic),
            SubscribeOptions::new()
                .with_group(agent_id.clone())
                .with_consumer(agent_id)
                .starting_at(GroupStart::Latest)
                .temporary(),
        )
        .await;

        match subscribed {
            Ok(id) => {
                info!(agent_id = %self.context.agent_id(), topic = %topic, "Subscribed to topic");
                subscriptions.insert(topic.to_string(), id);
                Ok(())
            }
            Err(e) => {
                self.handlers.write().remove(topic);
                Err(e)
            }
        }
    }

    /// Drop every handler for `topic` and stop reading it
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let subscription = self.subscriptions.lock().await.remove(topic);
        let had_handlers = self.handlers.write().remove(topic).is_some();
        if let Some(id) = subscription {
            self.context.bus().unsubscribe(&id).await;
        }
        had_handlers
    }

    /// Publish `payload` to `topic`; `Ok(None)` when middleware rejected it
    pub async fn publish(&self, topic: &str, payload: Payload) -> ProtocolResult<Option<EntryId>> {
        let message = ProtocolMessage::new(ProtocolAction::Publish, self.context.agent_id(), payload)
            .with_metadata(TOPIC_KEY, Value::String(topic.to_string()));
        self.context.send(&pubsub_stream(topic), message).await
    }

    pub async fn close(&self) {
        let topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        for topic in topics {
            self.unsubscribe(&topic).await;
        }
    }
}

#[async_trait]
impl ProtocolHandler for PublishSubscribeProtocol {
    fn pattern(&self) -> CommunicationPattern {
        CommunicationPattern::PublishSubscribe
    }

    fn context(&self) -> &ProtocolContext {
        &self.context
    }

    async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> ProtocolResult<Option<ProtocolMessage>> {
        if message.action != ProtocolAction::Publish {
            return Err(ProtocolError::unsupported(self.pattern(), message.action));
        }
        let Some(topic) = message.metadata_str(TOPIC_KEY).map(str::to_string) else {
            return Err(ProtocolError::invalid_message("publish without topic"));
        };

        let handlers = self.handlers.read().get(&topic).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(topic = %topic, "No handlers for topic");
            return Ok(None);
        }

        let runs = handlers.iter().map(|handler| {
            AssertUnwindSafe(handler(message.clone())).catch_unwind()
        });
        let outcomes = join_all(runs).await;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                topic = %topic,
                message_id = %message.id(),
                handler_index = index,
                error = %failure,
                "Topic handler failed"
            );
        }
        Ok(None)
    }
}
