//! Message-bus layer: append-only, length-trimmed streams with
//! consumer-group semantics.
//!
//! Topics are Redis streams. Every entry carries a single `data` field with a
//! UTF-8 JSON payload. Consumers use groups with a pending-entries list, so
//! delivery is at-least-once: handlers must be idempotent and an entry leaves
//! the PEL only when explicitly acknowledged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::RedisConfig;
use crate::error::Result;
use crate::models::Signal;

/// Topic names shared by every component.
pub mod topics {
    pub const TRADES: &str = "kalshi:trades";
    pub const TICKER_V2: &str = "kalshi:ticker_v2";
    pub const ORDERBOOK_DELTAS: &str = "kalshi:orderbook:deltas";
    pub const ORDERBOOK_SNAPSHOTS: &str = "kalshi:orderbook:snapshots";
    pub const LIFECYCLE: &str = "kalshi:lifecycle";
    pub const EVENT_LIFECYCLE: &str = "kalshi:event_lifecycle";
    pub const SYSTEM: &str = "kalshi:system";

    pub const SIGNALS_FLOW_TOXICITY: &str = "kalshi:signals:flow_toxicity";
    pub const SIGNALS_OI_DIVERGENCE: &str = "kalshi:signals:oi_divergence";
    pub const SIGNALS_REGIME: &str = "kalshi:signals:regime";
    pub const SIGNALS_CROSS_MARKET: &str = "kalshi:signals:cross_market";
    pub const SIGNALS_LIFECYCLE: &str = "kalshi:signals:lifecycle";
    pub const SIGNALS_ALL: &str = "kalshi:signals:all";
    pub const SIGNALS_COMPOSITE: &str = "kalshi:signals:composite";

    /// Per-processor output topics scanned for live signals.
    pub const ALL_SIGNAL_TOPICS: [&str; 5] = [
        SIGNALS_FLOW_TOXICITY,
        SIGNALS_OI_DIVERGENCE,
        SIGNALS_REGIME,
        SIGNALS_CROSS_MARKET,
        SIGNALS_LIFECYCLE,
    ];

    /// Soft cap applied with approximate trimming on append.
    pub fn maxlen(topic: &str) -> usize {
        if topic.starts_with("kalshi:signals") {
            10_000
        } else {
            100_000
        }
    }
}

/// Open a multiplexed connection to the bus/state store.
pub async fn connect(config: &RedisConfig) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(config.url())?;
    let conn = client.get_multiplexed_async_connection().await?;
    info!(host = %config.host, port = config.port, db = config.db, "redis_connected");
    Ok(conn)
}

/// One delivered entry: the bus-assigned id plus the `data` payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub data: String,
}

/// Batch handler invoked by [`StreamConsumer::consume`].
///
/// Returning `Err` leaves the batch unacknowledged so the bus redelivers it.
#[async_trait]
pub trait StreamHandler: Send {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()>;
}

/// Publishes payloads to topics with approximate MAXLEN trimming.
#[derive(Clone)]
pub struct StreamPublisher {
    conn: MultiplexedConnection,
    counts: HashMap<&'static str, u64>,
}

impl StreamPublisher {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            counts: HashMap::new(),
        }
    }

    /// Append a raw JSON payload. Returns the bus-assigned entry id.
    pub async fn publish_raw(&mut self, topic: &'static str, payload: &str) -> Result<String> {
        let maxlen = topics::maxlen(topic);
        let id: String = self
            .conn
            .xadd_maxlen(topic, StreamMaxlen::Approx(maxlen), "*", &[("data", payload)])
            .await?;
        *self.counts.entry(topic).or_insert(0) += 1;
        Ok(id)
    }

    /// Serialize and append a message.
    pub async fn publish<T: Serialize>(&mut self, topic: &'static str, msg: &T) -> Result<String> {
        let payload = serde_json::to_string(msg)?;
        self.publish_raw(topic, &payload).await
    }

    /// Publish a signal to its processor topic and to the fan-in topic.
    pub async fn publish_signal(&mut self, topic: &'static str, signal: &Signal) -> Result<()> {
        let payload = serde_json::to_string(signal)?;
        self.publish_raw(topic, &payload).await?;
        self.publish_raw(topics::SIGNALS_ALL, &payload).await?;
        debug!(
            signal_type = %signal.signal_type,
            market = %signal.market_ticker,
            direction = %signal.direction.as_str(),
            strength = signal.strength,
            "signal_emitted"
        );
        Ok(())
    }

    /// Return and reset per-topic publish counts (for periodic stats logs).
    pub fn take_counts(&mut self) -> HashMap<&'static str, u64> {
        std::mem::take(&mut self.counts)
    }
}

/// Reads recent signals back out of signal topics.
#[derive(Clone)]
pub struct SignalReader {
    conn: MultiplexedConnection,
}

impl SignalReader {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Most recent `count` signals on a topic, newest first.
    pub async fn recent_signals(&self, topic: &str, count: usize) -> Result<Vec<Signal>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(topic, "+", "-", count).await?;

        let mut signals = Vec::new();
        for entry in reply.ids {
            let Some(data) = entry.get::<String>("data") else {
                continue;
            };
            match serde_json::from_str::<Signal>(&data) {
                Ok(signal) => signals.push(signal),
                Err(_) => debug!(topic, id = %entry.id, "signal_parse_skip"),
            }
        }
        Ok(signals)
    }

    /// All live (non-expired) signals for one market across the processor topics.
    pub async fn active_signals_for_market(&self, market_ticker: &str) -> Result<Vec<Signal>> {
        let now = Utc::now();
        let mut active = Vec::new();

        for topic in topics::ALL_SIGNAL_TOPICS {
            match self.recent_signals(topic, 200).await {
                Ok(signals) => {
                    active.extend(
                        signals
                            .into_iter()
                            .filter(|s| s.market_ticker == market_ticker && !s.is_expired_at(now)),
                    );
                }
                Err(e) => debug!(topic, error = %e, "stream_read_error"),
            }
        }

        Ok(active)
    }
}

/// Batch size used when no explicit size is configured.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Block timeout for live reads.
const BLOCK_MS: usize = 5_000;

/// Consumes a topic through a consumer group, with pending-entry recovery.
#[derive(Clone)]
pub struct StreamConsumer {
    conn: MultiplexedConnection,
}

impl StreamConsumer {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Create the consumer group at position `0` if it does not exist yet.
    pub async fn ensure_group(&mut self, topic: &str, group: &str) -> Result<()> {
        let created: redis::RedisResult<String> = self
            .conn
            .xgroup_create_mkstream(topic, group, "0")
            .await;
        match created {
            Ok(_) => {
                info!(topic, group, "consumer_group_created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume forever: replay this consumer's pending entries, then read live.
    ///
    /// A batch is acknowledged only when the handler returns `Ok`; on `Err`
    /// the batch stays in the PEL and is redelivered after restart. Connection
    /// errors back off 5 s, anything else 1 s.
    pub async fn consume<H: StreamHandler>(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        handler: &mut H,
    ) -> Result<()> {
        self.ensure_group(topic, group).await?;
        self.process_pending(topic, group, consumer, batch_size, handler)
            .await;

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(batch_size)
            .block(BLOCK_MS);

        loop {
            let reply: redis::RedisResult<StreamReadReply> =
                self.conn.xread_options(&[topic], &[">"], &opts).await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if e.is_io_error() => {
                    error!(topic, error = %e, "bus_connection_lost");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                Err(e) => {
                    error!(topic, error = %e, "consumer_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for key in reply.keys {
                let (ids, entries) = collect_entries(&key.ids);
                if entries.is_empty() {
                    self.ack(topic, group, &ids).await;
                    continue;
                }

                match handler.handle(&entries).await {
                    Ok(()) => self.ack(topic, group, &ids).await,
                    Err(e) => {
                        // Not acked: the bus redelivers on the next cycle.
                        error!(topic, batch = entries.len(), error = %e, "handler_error");
                    }
                }
            }
        }
    }

    /// Drain entries left in this consumer's PEL by a previous crash.
    async fn process_pending<H: StreamHandler>(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        handler: &mut H,
    ) {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(batch_size);

        loop {
            let reply: redis::RedisResult<StreamReadReply> =
                self.conn.xread_options(&[topic], &["0"], &opts).await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    error!(topic, error = %e, "pending_read_error");
                    return;
                }
            };

            let mut drained = true;
            for key in reply.keys {
                if key.ids.is_empty() {
                    continue;
                }
                drained = false;

                let (ids, entries) = collect_entries(&key.ids);
                if entries.is_empty() {
                    // Only tombstones; ack them away and keep draining.
                    self.ack(topic, group, &ids).await;
                    continue;
                }

                match handler.handle(&entries).await {
                    Ok(()) => {
                        self.ack(topic, group, &ids).await;
                        info!(topic, count = entries.len(), "pending_messages_processed");
                    }
                    Err(e) => {
                        error!(topic, error = %e, "pending_handler_error");
                        return; // Leave the rest pending, move to live reads.
                    }
                }
            }

            if drained {
                return;
            }
        }
    }

    async fn ack(&mut self, topic: &str, group: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let acked: redis::RedisResult<i64> = self.conn.xack(topic, group, ids).await;
        if let Err(e) = acked {
            warn!(topic, error = %e, "ack_failed");
        }
    }

    /// Current length of a topic (backlog probe for health checks).
    pub async fn stream_len(&mut self, topic: &str) -> Result<i64> {
        Ok(self.conn.xlen(topic).await?)
    }
}

/// Split raw stream ids into (all ids, entries that carry a payload).
///
/// Entries with no fields are tombstones left by trimming; they are counted
/// for acknowledgement but never handed to the handler.
fn collect_entries(ids: &[redis::streams::StreamId]) -> (Vec<String>, Vec<StreamEntry>) {
    let mut all_ids = Vec::with_capacity(ids.len());
    let mut entries = Vec::with_capacity(ids.len());

    for raw in ids {
        all_ids.push(raw.id.clone());
        if raw.map.is_empty() {
            continue;
        }
        if let Some(data) = raw.get::<String>("data") {
            entries.push(StreamEntry {
                id: raw.id.clone(),
                data,
            });
        }
    }

    (all_ids, entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(topics::TRADES, "kalshi:trades");
        assert_eq!(topics::ORDERBOOK_DELTAS, "kalshi:orderbook:deltas");
        assert_eq!(topics::SIGNALS_ALL, "kalshi:signals:all");
        assert_eq!(topics::SIGNALS_COMPOSITE, "kalshi:signals:composite");
        assert_eq!(topics::ALL_SIGNAL_TOPICS.len(), 5);
    }

    #[test]
    fn test_topic_maxlen() {
        assert_eq!(topics::maxlen(topics::TRADES), 100_000);
        assert_eq!(topics::maxlen(topics::TICKER_V2), 100_000);
        assert_eq!(topics::maxlen(topics::SIGNALS_ALL), 10_000);
        assert_eq!(topics::maxlen(topics::SIGNALS_FLOW_TOXICITY), 10_000);
    }
}
