//! Redis Streams log transport.
//!
//! Publishes, acks and claims go through one multiplexed `ConnectionManager`.
//! Renewing an entry is `XCLAIM ... JUSTID` back to its owner; releasing one also
//! rewinds its idle time and delivery counter through `IDLE` and `RETRYCOUNT`.
//! `XREADGROUP ... BLOCK` holds its connection for the whole block window, so each
//! consumer gets its own reader connection to keep blocking reads from stalling
//! publishes or each other.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamRangeReply, StreamReadReply};
use tracing::{debug, info};

use super::{claimable_by, EntryId, GroupStart, LogStreamTransport, StreamEntry};
use crate::config::sanitize_url;
use crate::messaging::envelope::WireFields;
use crate::messaging::errors::{MessagingError, MessagingResult};

/// Idle time given to released entries so any claim window accepts them
const RELEASED_IDLE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Pending entries inspected per requested entry when claiming for an addressee
const ADDRESSEE_SCAN_FACTOR: usize = 8;

/// `XPENDING` extended reply row: id, owner, idle ms, deliveries
type PendingRow = (String, String, u64, u64);

/// Redis-backed [`LogStreamTransport`]
#[derive(Clone)]
pub struct RedisLogStream {
    client: redis::Client,
    connection_manager: ConnectionManager,
    readers: std::sync::Arc<DashMap<String, ConnectionManager>>,
}

impl std::fmt::Debug for RedisLogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLogStream")
            .field("connection_manager", &"ConnectionManager")
            .field("readers", &self.readers.len())
            .finish()
    }
}

impl RedisLogStream {
    pub async fn connect(url: &str) -> MessagingResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            MessagingError::connection(format!("Failed to create Redis client: {e}"))
        })?;

        let connection_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| MessagingError::connection(format!("Failed to connect to Redis: {e}")))?;

        info!(url = %sanitize_url(url), "Redis log stream connected");

        Ok(Self {
            client,
            connection_manager,
            readers: std::sync::Arc::new(DashMap::new()),
        })
    }

    async fn reader(&self, consumer_key: &str) -> MessagingResult<ConnectionManager> {
        if let Some(existing) = self.readers.get(consumer_key) {
            return Ok(existing.clone());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| MessagingError::connection(format!("Failed to open reader: {e}")))?;
        self.readers
            .insert(consumer_key.to_string(), manager.clone());
        Ok(manager)
    }

    async fn delivery_counts(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> MessagingResult<HashMap<String, u32>> {
        let mut conn = self.connection_manager.clone();
        let pending: Vec<PendingRow> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XPENDING", e.to_string()))?;

        Ok(pending
            .into_iter()
            .map(|(id, _consumer, _idle_ms, deliveries)| (id, saturating_u32(deliveries)))
            .collect())
    }

    /// Pending row of `id` when `consumer` owns it
    async fn owned_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<Option<PendingRow>> {
        let mut conn = self.connection_manager.clone();
        let rows: Vec<PendingRow> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .arg(id.as_str())
            .arg(1)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XPENDING", e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// `XPENDING IDLE` scan, `XRANGE` lookups of targets, then `XCLAIM` of the matches
    async fn claim_for_addressee(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
        addressee: &str,
    ) -> MessagingResult<Vec<StreamEntry>> {
        let mut conn = self.connection_manager.clone();
        let idle: Vec<PendingRow> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.saturating_mul(ADDRESSEE_SCAN_FACTOR))
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XPENDING", e.to_string()))?;

        let mut wanted: HashMap<String, u32> = HashMap::new();
        for (id, _owner, _idle_ms, deliveries) in idle {
            if wanted.len() >= count {
                break;
            }
            let range: StreamRangeReply = redis::cmd("XRANGE")
                .arg(stream)
                .arg(&id)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| MessagingError::stream_operation(stream, "XRANGE", e.to_string()))?;
            // Trimmed entries are left for the next unfiltered claim to drop
            let Some(entry) = range.ids.first() else {
                continue;
            };
            if claimable_by(&string_fields(stream, &entry.map)?, Some(addressee)) {
                wanted.insert(id, saturating_u32(deliveries).saturating_add(1));
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in wanted.keys() {
            cmd.arg(id);
        }
        let claimed: StreamClaimReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XCLAIM", e.to_string()))?;

        claimed
            .ids
            .into_iter()
            .map(|entry| {
                Ok(StreamEntry {
                    delivery_count: wanted.get(&entry.id).copied().unwrap_or(2),
                    fields: string_fields(stream, &entry.map)?,
                    id: EntryId::new(entry.id),
                })
            })
            .collect()
    }
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn string_fields(
    stream: &str,
    map: &HashMap<String, redis::Value>,
) -> MessagingResult<WireFields> {
    map.iter()
        .map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .map(|value| (key.clone(), value))
                .map_err(|e| MessagingError::stream_operation(stream, "decode", e.to_string()))
        })
        .collect()
}

#[async_trait]
impl LogStreamTransport for RedisLogStream {
    async fn append(
        &self,
        stream: &str,
        fields: &WireFields,
        max_len: Option<usize>,
    ) -> MessagingResult<EntryId> {
        let mut conn = self.connection_manager.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::delivery(stream, format!("XADD failed: {e}")))?;
        Ok(EntryId::new(id))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> MessagingResult<()> {
        let mut conn = self.connection_manager.clone();
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::Latest => "$",
        };

        match redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                Err(MessagingError::group_exists(stream, group))
            }
            Err(e) => Err(MessagingError::stream_operation(
                stream,
                "XGROUP CREATE",
                e.to_string(),
            )),
        }
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> MessagingResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XGROUP DESTROY", e.to_string()))?;

        let prefix = format!("{stream}/{group}/");
        self.readers.retain(|key, _| !key.starts_with(&prefix));
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
        let mut conn = self.reader(&format!("{stream}/{group}/{consumer}")).await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        // BLOCK 0 would wait forever
        let block_ms = duration_ms(block);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await.map_err(|e| {
            if e.code() == Some("NOGROUP") {
                MessagingError::group_not_found(stream, group)
            } else {
                MessagingError::stream_operation(stream, "XREADGROUP", e.to_string())
            }
        })?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                entries.push(StreamEntry {
                    fields: string_fields(stream, &id.map)?,
                    id: EntryId::new(id.id),
                    delivery_count: 1,
                });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> MessagingResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection_manager.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XACK", e.to_string()))
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
        let min_idle_ms = duration_ms(min_idle);
        if let Some(addressee) = addressee {
            return self
                .claim_for_addressee(stream, group, consumer, min_idle_ms, count, addressee)
                .await;
        }

        let mut conn = self.connection_manager.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XAUTOCLAIM", e.to_string()))?;

        // [next_cursor, [[id, [field, value, ...]] | nil, ...], deleted_ids?]
        let parts: Vec<redis::Value> = redis::from_redis_value(&reply)
            .map_err(|e| MessagingError::stream_operation(stream, "XAUTOCLAIM", e.to_string()))?;
        let claimed: Vec<Option<(String, HashMap<String, String>)>> = match parts.get(1) {
            Some(value) => redis::from_redis_value(value).map_err(|e| {
                MessagingError::stream_operation(stream, "XAUTOCLAIM", e.to_string())
            })?,
            None => Vec::new(),
        };
        let claimed: Vec<(String, WireFields)> = claimed.into_iter().flatten().collect();
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let counts = self.delivery_counts(stream, group, consumer, count.max(claimed.len())).await?;
        Ok(claimed
            .into_iter()
            .map(|(id, fields)| StreamEntry {
                delivery_count: counts.get(&id).copied().unwrap_or(2),
                id: EntryId::new(id),
                fields,
            })
            .collect())
    }

    async fn renew(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<bool> {
        if self.owned_pending(stream, group, consumer, id).await?.is_none() {
            return Ok(false);
        }
        let mut conn = self.connection_manager.clone();
        let renewed: Vec<String> = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(0)
            .arg(id.as_str())
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XCLAIM", e.to_string()))?;
        Ok(!renewed.is_empty())
    }

    async fn release(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &EntryId,
    ) -> MessagingResult<()> {
        let Some((_, _, _, deliveries)) = self.owned_pending(stream, group, consumer, id).await?
        else {
            return Ok(());
        };
        let mut conn = self.connection_manager.clone();
        redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(0)
            .arg(id.as_str())
            .arg("IDLE")
            .arg(RELEASED_IDLE_MS)
            .arg("RETRYCOUNT")
            .arg(deliveries.saturating_sub(1))
            .arg("JUSTID")
            .query_async::<Vec<String>>(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XCLAIM", e.to_string()))?;
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> MessagingResult<u64> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::stream_operation(stream, "XLEN", e.to_string()))
    }

    async fn ping(&self) -> MessagingResult<()> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::connection(format!("Redis PING failed: {e}")))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(MessagingError::connection(format!(
                "unexpected PING reply: {pong}"
            )))
        }
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}
