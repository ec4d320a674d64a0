//! # Log Stream Transport
//!
//! Append-only named logs with consumer groups. A group shares one read cursor
//! over a stream; every entry handed to a consumer stays pending until it is
//! acknowledged, and pending entries idle past a visibility window can be claimed
//! by another consumer of the group. That combination gives at-least-once,
//! competing-consumer delivery.
//!
//! A consumer holding an entry keeps it by renewing it; an entry it cannot act on
//! is released back to the group without spending a delivery attempt.
//!
//! ## Providers
//!
//! - [`InMemoryLogStream`]: process-local, used by tests and single-process setups
//! - `RedisLogStream` (feature `redis-streams`): Redis Streams

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::envelope::WireFields;
use super::errors::MessagingResult;

pub mod in_memory;
#[cfg(feature = "redis-streams")]
pub mod redis;

pub use in_memory::InMemoryLogStream;
#[cfg(feature = "redis-streams")]
pub use self::redis::RedisLogStream;

/// Identifier assigned by the transport to an appended entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entry read through a consumer group
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: WireFields,
    /// How many times the entry has been handed to a consumer, this delivery included
    pub delivery_count: u32,
}

/// Whether an entry may be claimed on behalf of `addressee`
pub(crate) fn claimable_by(fields: &WireFields, addressee: Option<&str>) -> bool {
    match (addressee, fields.get(TARGET_FIELD).map(String::as_str)) {
        (Some(addressee), Some(target)) if !target.is_empty() => target == addressee,
        _ => true,
    }
}

const TARGET_FIELD: &str = "target";

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStart {
    /// Every entry still retained in the stream
    #[default]
    Beginning,
    /// Only entries appended after the group is created
    Latest,
}

/// Operations the message bus needs from a log stream backend
#[async_trait]
pub trait LogStreamTransport: Send + Sync + 'static {
    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &WireFields,
        max_len: Option<usize>,
    ) -> MessagingResult<EntryId>;

    /// Create a consumer group, creating the stream when missing.
    ///
    /// Fails with `MessagingError::ConsumerGroupExists` when the group is already there.
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart)
        -> MessagingResult<()>;

    async fn destroy_group(&self, stream: &str, group: &str) -> MessagingResult<()>;

    /// Read entries not yet delivered to the group, waiting at most `block`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> MessagingResult<Vec<StreamEntry>>;

    /// Acknowledge entries, returning how many were pending
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> MessagingResult<u64>;

    /// Transfer entries pending for at least `min_idle` to `consumer`.
    ///
    /// With `addressee` set, entries whose `target` field names another consumer
    /// are left with their current owner.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        addressee: Option<&str>,
    ) -> MessagingResult<Vec<StreamEntry>>;

    /// Reset the idle time of an entry `consumer` still owns.
    ///
    /// Returns `false` when the entry was acknowledged or claimed by another consumer.
    async fn renew(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<bool>;

    /// Hand an entry owned by `consumer` back to the group.
    ///
    /// The delivery that handed it out is not counted, and the entry is
    /// claimable right away.
    async fn release(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<()>;

    async fn stream_len(&self, stream: &str) -> MessagingResult<u64>;

    async fn ping(&self) -> MessagingResult<()>;

    fn provider_name(&self) -> &'static str;
}
