//! # Message Bus
//!
//! Publishes envelopes to log streams, manages consumer-group subscriptions and
//! layers request/response on top of publish plus a temporary subscription.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use agentbus_core::config::BusConfig;
//! use agentbus_core::messaging::{
//!     handler_fn, DeliveryOutcome, InMemoryLogStream, MessageBus, MessageEnvelope, MessageKind,
//!     Payload, SubscribeOptions,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MessageBus::new(Arc::new(InMemoryLogStream::new()), BusConfig::default());
//!
//! let id = bus
//!     .subscribe(
//!         "supervisor:tasks",
//!         handler_fn(|envelope| async move {
//!             println!("got {}", envelope.id());
//!             Ok(DeliveryOutcome::Handled)
//!         }),
//!         SubscribeOptions::new().with_group("workers").with_consumer("worker-1"),
//!     )
//!     .await?;
//!
//! let task = MessageEnvelope::new(MessageKind::TaskRequest, "supervisor", Payload::new());
//! bus.publish("supervisor:tasks", &task).await?;
//!
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! bus.unsubscribe(&id).await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::envelope::MessageEnvelope;
use super::errors::{MessagingError, MessagingResult};
use super::shutdown::ShutdownSignal;
use super::subscription::{
    ensure_group, handler_fn, DeliveryLoop, DeliveryOutcome, EnvelopeHandler, SubscribeOptions,
    SubscriptionId, SubscriptionInfo,
};
use super::transport::{EntryId, GroupStart, LogStreamTransport};
use crate::config::BusConfig;
use crate::constants::response_stream;
use crate::metrics;

/// Counters shared by the bus and its delivery loops
#[derive(Debug, Default)]
pub struct BusStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
    handler_errors: AtomicU64,
    decode_errors: AtomicU64,
    read_errors: AtomicU64,
    expired: AtomicU64,
    foreign_skipped: AtomicU64,
    dead_lettered: AtomicU64,
    reclaimed: AtomicU64,
    ownership_lost: AtomicU64,
}

impl BusStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_foreign_skipped(&self) {
        self.foreign_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self, count: u64) {
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_ownership_lost(&self) {
        self.ownership_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            foreign_skipped: self.foreign_skipped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            ownership_lost: self.ownership_lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub delivered: u64,
    pub acked: u64,
    pub ack_failures: u64,
    pub handler_errors: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
    pub expired: u64,
    pub foreign_skipped: u64,
    pub dead_lettered: u64,
    pub reclaimed: u64,
    /// Entries claimed away by another consumer before or while being handled
    pub ownership_lost: u64,
}

/// Result of [`MessageBus::health_check`]; transport errors are captured, never raised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusHealthReport {
    pub healthy: bool,
    pub provider: String,
    pub transport_reachable: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub active_subscriptions: usize,
    pub active_streams: usize,
    pub streams: Vec<String>,
    pub consumers: Vec<String>,
    pub stats: BusStatsSnapshot,
    pub checked_at: DateTime<Utc>,
}

struct ActiveSubscription {
    info: SubscriptionInfo,
    shutdown: ShutdownSignal,
    handle: JoinHandle<()>,
}

type SubscriptionRegistry = DashMap<SubscriptionId, ActiveSubscription>;

/// Stop a detached subscription and wait for its loop to finish
async fn teardown(transport: Arc<dyn LogStreamTransport>, subscription: ActiveSubscription) {
    let ActiveSubscription {
        info,
        shutdown,
        handle,
    } = subscription;

    shutdown.trigger();
    if let Err(e) = handle.await {
        error!(subscription_id = %info.id, error = %e, "Delivery loop terminated abnormally");
    }

    if info.temporary {
        if let Err(e) = transport.destroy_group(&info.stream, &info.group).await {
            warn!(stream = %info.stream, group = %info.group, error = %e, "Failed to remove temporary consumer group");
        }
    }

    debug!(subscription_id = %info.id, stream = %info.stream, "Subscription removed");
}

/// Unsubscribes on drop unless released explicitly, so a cancelled caller never
/// leaks a temporary subscription.
struct SubscriptionGuard {
    id: Option<SubscriptionId>,
    subscriptions: Arc<SubscriptionRegistry>,
    transport: Arc<dyn LogStreamTransport>,
}

impl SubscriptionGuard {
    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                teardown(self.transport.clone(), subscription).await;
            }
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some((_, subscription)) = self.subscriptions.remove(&id) {
            subscription.shutdown.trigger();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(teardown(self.transport.clone(), subscription));
            }
        }
    }
}

/// Log-stream message bus
pub struct MessageBus {
    transport: Arc<dyn LogStreamTransport>,
    config: BusConfig,
    stats: Arc<BusStats>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("provider", &self.transport.provider_name())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl MessageBus {
    pub fn new(transport: Arc<dyn LogStreamTransport>, config: BusConfig) -> Self {
        info!(
            provider = transport.provider_name(),
            max_stream_length = config.max_stream_length,
            batch_size = config.batch_size,
            "Message bus created"
        );
        Self {
            transport,
            config,
            stats: Arc::new(BusStats::default()),
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn LogStreamTransport> {
        &self.transport
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    /// Append an envelope to `stream`.
    ///
    /// Any error, including the publish timeout, means the envelope was not delivered.
    pub async fn publish(
        &self,
        stream: &str,
        envelope: &MessageEnvelope,
    ) -> MessagingResult<EntryId> {
        let fields = match envelope.to_wire_fields() {
            Ok(fields) => fields,
            Err(e) => {
                self.stats.record_publish_failure();
                return Err(e);
            }
        };

        let timeout = self.config.publish_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport
                .append(stream, &fields, Some(self.config.max_stream_length)),
        )
        .await
        {
            Ok(Ok(entry_id)) => Ok(entry_id),
            Ok(Err(e @ MessagingError::Delivery { .. })) => Err(e),
            Ok(Err(e)) => Err(MessagingError::delivery(stream, e.to_string())),
            Err(_) => Err(MessagingError::delivery(
                stream,
                format!("publish timed out after {}ms", timeout.as_millis()),
            )),
        };

        match &result {
            Ok(entry_id) => {
                self.stats.record_published();
                metrics::messages_published_total()
                    .add(1, &[KeyValue::new("stream", stream.to_string())]);
                debug!(
                    stream = %stream,
                    message_id = %envelope.id(),
                    message_type = %envelope.kind(),
                    entry_id = %entry_id,
                    "Envelope published"
                );
            }
            Err(e) => {
                self.stats.record_publish_failure();
                warn!(
                    stream = %stream,
                    message_id = %envelope.id(),
                    error = %e,
                    "Envelope publish failed"
                );
            }
        }
        result
    }

    /// Start a delivery loop for `stream`, creating the consumer group when needed.
    pub async fn subscribe(
        &self,
        stream: &str,
        handler: Arc<dyn EnvelopeHandler>,
        options: SubscribeOptions,
    ) -> MessagingResult<SubscriptionId> {
        let group = options
            .group
            .clone()
            .unwrap_or_else(|| self.config.default_group.clone());
        let consumer = options
            .consumer
            .clone()
            .unwrap_or_else(|| self.config.default_consumer.clone());

        ensure_group(self.transport.as_ref(), stream, &group, options.start).await?;

        let info = SubscriptionInfo {
            id: SubscriptionId::new(),
            stream: stream.to_string(),
            group,
            consumer,
            temporary: options.temporary,
            started_at: Utc::now(),
        };
        let shutdown = ShutdownSignal::new();
        let delivery = DeliveryLoop {
            info: info.clone(),
            options,
            handler,
            transport: self.transport.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            listener: shutdown.listener(),
        };
        let handle = tokio::spawn(delivery.run());

        info!(
            subscription_id = %info.id,
            stream = %info.stream,
            group = %info.group,
            consumer = %info.consumer,
            "Subscribed"
        );

        let id = info.id.clone();
        self.subscriptions.insert(
            id.clone(),
            ActiveSubscription {
                info,
                shutdown,
                handle,
            },
        );
        Ok(id)
    }

    /// Cancel a subscription and wait for its in-flight delivery to finish.
    ///
    /// Returns `false` when the id is unknown. Must not be awaited from inside the
    /// handler of the same subscription.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, subscription)) => {
                teardown(self.transport.clone(), subscription).await;
                true
            }
            None => false,
        }
    }

    /// Publish `request` and wait for the envelope carrying its correlation id.
    ///
    /// A fresh correlation id replaces any the request carried; responders must
    /// publish to the request's `reply_to` (`<stream>:responses`).
    pub async fn request_response(
        &self,
        stream: &str,
        request: MessageEnvelope,
        timeout: Duration,
    ) -> MessagingResult<MessageEnvelope> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_stream = response_stream(stream);
        let request = request
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_stream.clone());

        let (tx, rx) = oneshot::channel::<MessageEnvelope>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let expected = correlation_id.clone();
        let handler = handler_fn(move |envelope: MessageEnvelope| {
            let slot = slot.clone();
            let expected = expected.clone();
            async move {
                if envelope.correlation_id() == Some(expected.as_str()) {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(envelope);
                    }
                }
                Ok(DeliveryOutcome::Handled)
            }
        });

        let responder_id = format!("rr:{correlation_id}");
        let subscription_id = self
            .subscribe(
                &reply_stream,
                handler,
                SubscribeOptions::new()
                    .with_group(responder_id.clone())
                    .with_consumer(responder_id)
                    .starting_at(GroupStart::Latest)
                    .temporary(),
            )
            .await?;
        let guard = SubscriptionGuard {
            id: Some(subscription_id),
            subscriptions: self.subscriptions.clone(),
            transport: self.transport.clone(),
        };

        let outcome = async {
            self.publish(stream, &request).await?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(MessagingError::internal(
                    "response subscription closed before a reply arrived",
                )),
                Err(_) => Err(MessagingError::timeout(
                    format!("request_response on {stream}"),
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                )),
            }
        }
        .await;

        guard.release().await;

        match &outcome {
            Ok(_) => debug!(stream = %stream, correlation_id = %correlation_id, "Response received"),
            Err(e) => warn!(stream = %stream, correlation_id = %correlation_id, error = %e, "Request failed"),
        }
        outcome
    }

    /// Report transport reachability and subscription state. Never fails.
    pub async fn health_check(&self) -> BusHealthReport {
        let started = tokio::time::Instant::now();
        let ping = tokio::time::timeout(self.config.publish_timeout(), self.transport.ping()).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (transport_reachable, error) = match ping {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("transport ping timed out".to_string())),
        };

        let subscriptions = self.active_subscriptions();
        let streams: BTreeSet<String> = subscriptions.iter().map(|s| s.stream.clone()).collect();
        let consumers: BTreeSet<String> = subscriptions
            .iter()
            .map(|s| format!("{}/{}/{}", s.stream, s.group, s.consumer))
            .collect();

        if let Some(error) = &error {
            warn!(provider = self.transport.provider_name(), error = %error, "Bus health check failed");
        }

        BusHealthReport {
            healthy: transport_reachable,
            provider: self.transport.provider_name().to_string(),
            transport_reachable,
            latency_ms,
            error,
            active_subscriptions: subscriptions.len(),
            active_streams: streams.len(),
            streams: streams.into_iter().collect(),
            consumers: consumers.into_iter().collect(),
            stats: self.stats.snapshot(),
            checked_at: Utc::now(),
        }
    }

    /// Cancel every subscription and wait for the loops to finish
    pub async fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.unsubscribe(&id).await;
        }
        info!("Message bus shut down");
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().shutdown.trigger();
        }
    }
}
