//! # In-Memory Log Stream
//!
//! Process-local log stream with consumer groups for tests and development.
//!
//! ## Features
//!
//! - **Consumer groups**: one read cursor per group, entries delivered to exactly one consumer
//! - **Pending entries**: unacknowledged entries are tracked per group with their owner
//! - **Idle claim**: entries pending longer than a visibility window can be claimed by another consumer
//! - **Renew and release**: owners keep entries alive while working, or hand them back uncounted
//! - **Blocking reads**: readers park on a `Notify` until an append or the block timeout
//! - **Outage simulation**: `set_available(false)` makes every call fail with a connection error

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use super::{claimable_by, EntryId, GroupStart, LogStreamTransport, StreamEntry};
use crate::messaging::envelope::WireFields;
use crate::messaging::errors::{MessagingError, MessagingResult};

#[derive(Debug)]
struct LogEntry {
    seq: u64,
    id: EntryId,
    fields: WireFields,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    /// `None` once released; claimable regardless of the idle window
    delivered_at: Option<Instant>,
    delivery_count: u32,
}

impl PendingEntry {
    fn idle_for(&self, now: Instant, min_idle: Duration) -> bool {
        self.delivered_at
            .map_or(true, |at| now.duration_since(at) >= min_idle)
    }
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    /// Highest sequence number handed out through a fresh read
    last_delivered_seq: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct InMemoryStream {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    groups: HashMap<String, ConsumerGroup>,
}

impl InMemoryStream {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            groups: HashMap::new(),
        }
    }

    fn entry(&self, seq: u64) -> Option<&LogEntry> {
        self.entries
            .binary_search_by_key(&seq, |entry| entry.seq)
            .ok()
            .and_then(|index| self.entries.get(index))
    }
}

/// In-memory [`LogStreamTransport`]
#[derive(Debug)]
pub struct InMemoryLogStream {
    streams: RwLock<HashMap<String, InMemoryStream>>,
    appended: Notify,
    available: AtomicBool,
}

impl Default for InMemoryLogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStream {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        // Wake blocked readers so they observe the change
        self.appended.notify_waiters();
    }

    /// Number of entries pending acknowledgement for a group (for testing)
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.read().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Group names registered on a stream (for testing)
    pub async fn group_names(&self, stream: &str) -> Vec<String> {
        let streams = self.streams.read().await;
        let mut names: Vec<String> = streams
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn ensure_available(&self) -> MessagingResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::connection("in-memory log stream unavailable"))
        }
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> MessagingResult<Vec<StreamEntry>> {
        let mut streams = self.streams.write().await;
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| MessagingError::group_not_found(stream, group))?;

        let InMemoryStream {
            entries, groups, ..
        } = log;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| MessagingError::group_not_found(stream, group))?;

        let now = Instant::now();
        let cursor = group_state.last_delivered_seq;
        let mut delivered = Vec::new();
        for entry in entries.iter().filter(|entry| entry.seq > cursor).take(count) {
            group_state.last_delivered_seq = entry.seq;
            group_state.pending.insert(
                entry.seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Some(now),
                    delivery_count: 1,
                },
            );
            delivered.push(StreamEntry {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
                delivery_count: 1,
            });
        }
        Ok(delivered)
    }

    /// Pending record of `id` in `group`, when `consumer` still owns it
    fn owned_mut<'a>(
        streams: &'a mut HashMap<String, InMemoryStream>,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<Option<&'a mut PendingEntry>> {
        let group_state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| MessagingError::group_not_found(stream, group))?;
        Ok(sequence_of(id)
            .and_then(|seq| group_state.pending.get_mut(&seq))
            .filter(|pending| pending.consumer == consumer))
    }
}

fn sequence_of(id: &EntryId) -> Option<u64> {
    id.as_str()
        .rsplit_once('-')
        .and_then(|(_, seq)| seq.parse().ok())
}

#[async_trait]
impl LogStreamTransport for InMemoryLogStream {
    async fn append(
        &self,
        stream: &str,
        fields: &WireFields,
        max_len: Option<usize>,
    ) -> MessagingResult<EntryId> {
        self.ensure_available()?;

        let id = {
            let mut streams = self.streams.write().await;
            let log = streams
                .entry(stream.to_string())
                .or_insert_with(InMemoryStream::new);

            let seq = log.next_seq;
            log.next_seq += 1;
            let id = EntryId::new(format!("{}-{}", Utc::now().timestamp_millis(), seq));
            log.entries.push_back(LogEntry {
                seq,
                id: id.clone(),
                fields: fields.clone(),
            });

            if let Some(max_len) = max_len {
                while log.entries.len() > max_len {
                    log.entries.pop_front();
                }
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> MessagingResult<()> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        let log = streams
            .entry(stream.to_string())
            .or_insert_with(InMemoryStream::new);

        if log.groups.contains_key(group) {
            return Err(MessagingError::group_exists(stream, group));
        }

        let last_delivered_seq = match start {
            GroupStart::Beginning => 0,
            GroupStart::Latest => log.next_seq - 1,
        };
        log.groups.insert(
            group.to_string(),
            ConsumerGroup {
                last_delivered_seq,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> MessagingResult<()> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        if let Some(log) = streams.get_mut(stream) {
            log.groups.remove(group);
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> MessagingResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_available()?;
            let entries = self.read_new(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> MessagingResult<u64> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        let group_state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| MessagingError::group_not_found(stream, group))?;

        let acked = ids
            .iter()
            .filter_map(sequence_of)
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        addressee: Option<&str>,
    ) -> MessagingResult<Vec<StreamEntry>> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        let log = streams
            .get_mut(stream)
            .ok_or_else(|| MessagingError::group_not_found(stream, group))?;

        let now = Instant::now();
        let mut claimable = Vec::new();
        let mut trimmed = Vec::new();
        {
            let group_state = log
                .groups
                .get(group)
                .ok_or_else(|| MessagingError::group_not_found(stream, group))?;
            for (seq, pending) in &group_state.pending {
                if claimable.len() >= count {
                    break;
                }
                if !pending.idle_for(now, min_idle) {
                    continue;
                }
                match log.entry(*seq) {
                    Some(entry) if claimable_by(&entry.fields, addressee) => {
                        claimable.push((*seq, entry.id.clone(), entry.fields.clone()));
                    }
                    Some(_) => {}
                    None => trimmed.push(*seq),
                }
            }
        }

        let Some(group_state) = log.groups.get_mut(group) else {
            return Err(MessagingError::group_not_found(stream, group));
        };
        // Entries trimmed out of the log can never be delivered again
        for seq in trimmed {
            group_state.pending.remove(&seq);
        }

        let mut entries = Vec::with_capacity(claimable.len());
        for (seq, id, fields) in claimable {
            if let Some(pending) = group_state.pending.get_mut(&seq) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Some(now);
                pending.delivery_count += 1;
                entries.push(StreamEntry {
                    id,
                    fields,
                    delivery_count: pending.delivery_count,
                });
            }
        }
        Ok(entries)
    }

    async fn renew(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<bool> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        match Self::owned_mut(&mut streams, stream, group, consumer, id)? {
            Some(pending) => {
                pending.delivered_at = Some(Instant::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<()> {
        self.ensure_available()?;

        let mut streams = self.streams.write().await;
        if let Some(pending) = Self::owned_mut(&mut streams, stream, group, consumer, id)? {
            pending.delivered_at = None;
            pending.delivery_count = pending.delivery_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> MessagingResult<u64> {
        self.ensure_available()?;

        let streams = self.streams.read().await;
        Ok(streams
            .get(stream)
            .map(|log| log.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> MessagingResult<()> {
        self.ensure_available()
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
