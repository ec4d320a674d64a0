//! # Subscriptions
//!
//! Handler contract, subscription options and the per-subscription delivery loop.
//!
//! The loop reads at most `max_in_flight` entries for its consumer group, decodes
//! each into a [`MessageEnvelope`] and awaits the handler. While the handler runs
//! the entry is renewed, so no sibling can claim it; an entry that was claimed away
//! while waiting is skipped.
//!
//! Handler errors and panics are logged and counted. The entry stays pending and
//! becomes eligible for redelivery once it has been idle past the visibility
//! timeout, unless that was its final attempt, in which case it is dead-lettered.
//! Released entries and entries addressed to another consumer are handed back
//! without spending an attempt. Only cancellation ends the loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bus::BusStats;
use super::envelope::MessageEnvelope;
use super::errors::MessagingError;
use super::shutdown::ShutdownListener;
use super::transport::{EntryId, GroupStart, LogStreamTransport, StreamEntry};
use crate::config::BusConfig;
use crate::metrics;

/// Identifier returned by `MessageBus::subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the delivery loop should do with an entry after the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed; acknowledged when the subscription auto-acks
    Handled,
    /// Handed back to the group, uncounted, for another consumer to claim
    Released,
}

/// Receives envelopes from a subscription
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<DeliveryOutcome>;
}

/// Adapter turning an async closure into an [`EnvelopeHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<DeliveryOutcome>> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<DeliveryOutcome> {
        (self.f)(envelope).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<DeliveryOutcome>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Treatment of envelopes targeted at a different consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignTargetPolicy {
    /// Hand back so the addressed consumer can claim it (shared groups)
    #[default]
    Release,
    /// Acknowledge and drop (private groups, where nobody else will read it)
    Discard,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub group: Option<String>,
    pub consumer: Option<String>,
    pub auto_ack: bool,
    pub start: GroupStart,
    pub target_filter: Option<String>,
    pub foreign_targets: ForeignTargetPolicy,
    /// Entries read and handled concurrently; also caps each read
    pub max_in_flight: usize,
    /// Destroy the consumer group when the subscription ends
    pub temporary: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            group: None,
            consumer: None,
            auto_ack: true,
            start: GroupStart::Beginning,
            target_filter: None,
            foreign_targets: ForeignTargetPolicy::Release,
            max_in_flight: 1,
            temporary: false,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn starting_at(mut self, start: GroupStart) -> Self {
        self.start = start;
        self
    }

    /// Only hand envelopes addressed to `consumer_id` (or untargeted) to the handler
    pub fn with_target_filter(
        mut self,
        consumer_id: impl Into<String>,
        policy: ForeignTargetPolicy,
    ) -> Self {
        self.target_filter = Some(consumer_id.into());
        self.foreign_targets = policy;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

/// Snapshot describing an active subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub temporary: bool,
    pub started_at: DateTime<Utc>,
}

/// Create a consumer group, treating "already exists" as success
pub(crate) async fn ensure_group(
    transport: &dyn LogStreamTransport,
    stream: &str,
    group: &str,
    start: GroupStart,
) -> Result<(), MessagingError> {
    match transport.create_group(stream, group, start).await {
        Ok(()) | Err(MessagingError::ConsumerGroupExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) struct DeliveryLoop {
    pub(crate) info: SubscriptionInfo,
    pub(crate) options: SubscribeOptions,
    pub(crate) handler: Arc<dyn EnvelopeHandler>,
    pub(crate) transport: Arc<dyn LogStreamTransport>,
    pub(crate) config: BusConfig,
    pub(crate) stats: Arc<BusStats>,
    pub(crate) listener: ShutdownListener,
}

impl DeliveryLoop {
    pub(crate) async fn run(mut self) {
        info!(
            subscription_id = %self.info.id,
            stream = %self.info.stream,
            group = %self.info.group,
            consumer = %self.info.consumer,
            "Delivery loop started"
        );

        let batch_size = self.config.batch_size.min(self.options.max_in_flight).max(1);
        let block = self.config.block_timeout();
        let mut last_claim = Instant::now();

        loop {
            if self.listener.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = self.listener.cancelled() => break,
                result = self.transport.read_group(
                    &self.info.stream,
                    &self.info.group,
                    &self.info.consumer,
                    batch_size,
                    block,
                ) => result,
            };

            match read {
                Ok(entries) => self.dispatch(entries, Instant::now()).await,
                Err(e) => {
                    self.stats.record_read_error();
                    warn!(
                        subscription_id = %self.info.id,
                        stream = %self.info.stream,
                        error = %e,
                        "Stream read failed, backing off"
                    );
                    if matches!(e, MessagingError::ConsumerGroupNotFound { .. }) {
                        self.recreate_group().await;
                    }
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            }

            if last_claim.elapsed() >= self.config.claim_interval() {
                last_claim = Instant::now();
                self.reclaim_idle(batch_size).await;
            }
        }

        info!(
            subscription_id = %self.info.id,
            stream = %self.info.stream,
            "Delivery loop stopped"
        );
    }

    /// Returns true when cancelled during the backoff
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            _ = self.listener.cancelled() => true,
            _ = tokio::time::sleep(self.config.error_backoff()) => false,
        }
    }

    async fn recreate_group(&self) {
        if let Err(e) = ensure_group(
            self.transport.as_ref(),
            &self.info.stream,
            &self.info.group,
            self.options.start,
        )
        .await
        {
            warn!(stream = %self.info.stream, group = %self.info.group, error = %e, "Failed to recreate consumer group");
        }
    }

    async fn reclaim_idle(&self, batch_size: usize) {
        match self
            .transport
            .claim_idle(
                &self.info.stream,
                &self.info.group,
                &self.info.consumer,
                self.config.visibility_timeout(),
                batch_size,
                self.options.target_filter.as_deref(),
            )
            .await
        {
            Ok(entries) if entries.is_empty() => {}
            Ok(entries) => {
                info!(
                    subscription_id = %self.info.id,
                    stream = %self.info.stream,
                    count = entries.len(),
                    "Reclaimed idle pending entries"
                );
                self.stats.record_reclaimed(entries.len() as u64);
                self.dispatch(entries, Instant::now()).await;
            }
            Err(e) => {
                warn!(stream = %self.info.stream, error = %e, "Idle entry claim failed");
            }
        }
    }

    async fn dispatch(&self, entries: Vec<StreamEntry>, received: Instant) {
        if self.options.max_in_flight <= 1 {
            for entry in entries {
                self.process_entry(entry, received).await;
            }
        } else {
            futures::stream::iter(entries)
                .for_each_concurrent(self.options.max_in_flight, |entry| {
                    self.process_entry(entry, received)
                })
                .await;
        }
    }

    /// Interval between renewals of an entry whose handler is still running
    fn renew_period(&self) -> Duration {
        (self.config.visibility_timeout() / 3).max(Duration::from_millis(10))
    }

    /// False when another consumer has taken the entry over
    async fn renew(&self, id: &EntryId) -> bool {
        match self
            .transport
            .renew(&self.info.stream, &self.info.group, &self.info.consumer, id)
            .await
        {
            Ok(owned) => owned,
            Err(e) => {
                warn!(stream = %self.info.stream, entry_id = %id, error = %e, "Entry renewal failed");
                true
            }
        }
    }

    async fn process_entry(&self, entry: StreamEntry, received: Instant) {
        // Nobody can claim an entry before it has idled for the visibility timeout
        if received.elapsed() >= self.config.visibility_timeout() / 2 && !self.renew(&entry.id).await
        {
            self.stats.record_ownership_lost();
            debug!(stream = %self.info.stream, entry_id = %entry.id, "Entry claimed by another consumer, skipping");
            return;
        }

        let envelope = match MessageEnvelope::from_wire_fields(&entry.fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.record_decode_error();
                error!(
                    stream = %self.info.stream,
                    entry_id = %entry.id,
                    error = %e,
                    "Dropping undecodable entry"
                );
                self.ack(&entry.id).await;
                return;
            }
        };

        if envelope.is_expired() {
            self.stats.record_expired();
            debug!(message_id = %envelope.id(), stream = %self.info.stream, "Skipping expired envelope");
            self.ack(&entry.id).await;
            return;
        }

        if let Some(consumer_id) = self.options.target_filter.as_deref() {
            if !envelope.is_addressed_to(consumer_id) {
                self.stats.record_foreign_skipped();
                debug!(
                    message_id = %envelope.id(),
                    target = envelope.target().unwrap_or_default(),
                    consumer = %consumer_id,
                    "Envelope addressed to another consumer"
                );
                match self.options.foreign_targets {
                    ForeignTargetPolicy::Discard => self.ack(&entry.id).await,
                    ForeignTargetPolicy::Release => self.release(&entry.id).await,
                }
                return;
            }
        }

        if entry.delivery_count > envelope.max_retries().saturating_add(1) {
            self.stats.record_dead_lettered();
            warn!(
                message_id = %envelope.id(),
                stream = %self.info.stream,
                delivery_count = entry.delivery_count,
                max_retries = envelope.max_retries(),
                "Delivery attempts exhausted, dropping envelope"
            );
            self.ack(&entry.id).await;
            return;
        }

        let envelope = envelope.with_retries(entry.delivery_count.saturating_sub(1));
        let message_id = envelope.id().to_string();
        let final_attempt = envelope.retries_exhausted();
        self.stats.record_delivered();
        metrics::messages_delivered_total()
            .add(1, &[KeyValue::new("stream", self.info.stream.clone())]);

        match self.run_handler(&entry.id, envelope).await {
            Ok(Ok(DeliveryOutcome::Handled)) => {
                if self.options.auto_ack {
                    self.ack(&entry.id).await;
                }
                return;
            }
            Ok(Ok(DeliveryOutcome::Released)) => {
                debug!(message_id = %message_id, stream = %self.info.stream, "Handler released envelope");
                self.release(&entry.id).await;
                return;
            }
            Ok(Err(e)) => {
                self.record_handler_error();
                error!(
                    message_id = %message_id,
                    stream = %self.info.stream,
                    subscription_id = %self.info.id,
                    error = %e,
                    "Handler failed, entry left pending for redelivery"
                );
            }
            Err(panic) => {
                self.record_handler_error();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    message_id = %message_id,
                    stream = %self.info.stream,
                    subscription_id = %self.info.id,
                    panic = %reason,
                    "Handler panicked, entry left pending for redelivery"
                );
            }
        }

        if final_attempt {
            self.stats.record_dead_lettered();
            warn!(
                message_id = %message_id,
                stream = %self.info.stream,
                "Final delivery attempt failed, dropping envelope"
            );
            self.ack(&entry.id).await;
        }
    }

    /// Await the handler, renewing the entry until it returns
    async fn run_handler(
        &self,
        id: &EntryId,
        envelope: MessageEnvelope,
    ) -> std::thread::Result<anyhow::Result<DeliveryOutcome>> {
        let handling = AssertUnwindSafe(self.handler.handle(envelope)).catch_unwind();
        tokio::pin!(handling);

        let period = self.renew_period();
        let mut renewal = tokio::time::interval_at(Instant::now() + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut owned = true;
        loop {
            tokio::select! {
                result = &mut handling => return result,
                _ = renewal.tick(), if owned => {
                    if !self.renew(id).await {
                        owned = false;
                        self.stats.record_ownership_lost();
                        warn!(stream = %self.info.stream, entry_id = %id, "Entry claimed by another consumer mid-handling");
                    }
                }
            }
        }
    }

    async fn release(&self, id: &EntryId) {
        if let Err(e) = self
            .transport
            .release(&self.info.stream, &self.info.group, &self.info.consumer, id)
            .await
        {
            warn!(stream = %self.info.stream, entry_id = %id, error = %e, "Release failed, entry waits for the visibility timeout");
        }
    }

    fn record_handler_error(&self) {
        self.stats.record_handler_error();
        metrics::handler_errors_total()
            .add(1, &[KeyValue::new("stream", self.info.stream.clone())]);
    }

    async fn ack(&self, id: &EntryId) {
        match self
            .transport
            .ack(&self.info.stream, &self.info.group, std::slice::from_ref(id))
            .await
        {
            Ok(_) => self.stats.record_acked(),
            Err(e) => {
                self.stats.record_ack_failure();
                warn!(
                    stream = %self.info.stream,
                    entry_id = %id,
                    error = %e,
                    "Acknowledgement failed, entry will be redelivered"
                );
            }
        }
    }
}
