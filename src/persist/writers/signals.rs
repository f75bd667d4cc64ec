//! Signal writer: `kalshi:signals:all` -> `signal_log` table.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::Signal;

const CONSUMER_NAME: &str = "signal_writer_1";
const BATCH_SIZE: usize = 50;

/// When a signal stops being live, derived from its timestamp and TTL.
pub(crate) fn expired_at(ts: DateTime<Utc>, ttl_seconds: i64) -> DateTime<Utc> {
    ts + Duration::seconds(ttl_seconds)
}

pub struct SignalWriter {
    pool: PgPool,
    total_written: u64,
}

impl SignalWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("signal_writer_started");
        consumer
            .consume(topics::SIGNALS_ALL, CONSUMER_GROUP, CONSUMER_NAME, BATCH_SIZE, &mut self)
            .await
    }

    async fn flush(pool: &PgPool, signals: &[Signal]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for signal in signals {
            sqlx::query(
                "INSERT INTO signal_log (ts, signal_id, signal_type, market_ticker, event_ticker,
                     series_ticker, direction, strength, confidence, urgency, metadata,
                     ttl_seconds, expired_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (signal_id) DO NOTHING",
            )
            .bind(signal.ts)
            .bind(&signal.signal_id)
            .bind(&signal.signal_type)
            .bind(&signal.market_ticker)
            .bind(signal.event_ticker.as_deref())
            .bind(signal.series_ticker.as_deref())
            .bind(signal.direction.as_str())
            .bind(signal.strength)
            .bind(signal.confidence)
            .bind(signal.urgency.as_str())
            .bind(&signal.metadata)
            .bind(signal.ttl_seconds)
            .bind(expired_at(signal.ts, signal.ttl_seconds))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for SignalWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let signals: Vec<Signal> = parse_batch(topics::SIGNALS_ALL, entries);
        if signals.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("signals", || Self::flush(&pool, &signals)).await?;

        self.total_written += signals.len() as u64;
        debug!(count = signals.len(), total = self.total_written, "signals_flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_at() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            expired_at(ts, 300).to_rfc3339(),
            "2024-01-01T00:05:00+00:00"
        );
    }
}
