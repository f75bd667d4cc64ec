//! Lifecycle writer: `kalshi:lifecycle` -> `lifecycle_events` table, with the
//! corresponding `markets.status` update in the same transaction.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::MarketLifecycleEvent;

const CONSUMER_NAME: &str = "lifecycle_writer_1";
const BATCH_SIZE: usize = 50;

pub struct LifecycleWriter {
    pool: PgPool,
    total_written: u64,
}

impl LifecycleWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("lifecycle_writer_started");
        consumer
            .consume(topics::LIFECYCLE, CONSUMER_GROUP, CONSUMER_NAME, BATCH_SIZE, &mut self)
            .await
    }

    async fn flush(
        pool: &PgPool,
        events: &[MarketLifecycleEvent],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO lifecycle_events (ts, market_ticker, market_id, status)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(event.timestamp())
            .bind(&event.market_ticker)
            .bind((!event.market_id.is_empty()).then_some(&event.market_id))
            .bind(event.effective_status())
            .execute(&mut *tx)
            .await?;

            // Terminal markets never transition back; leave them untouched.
            sqlx::query(
                "UPDATE markets SET status = $2, last_synced_at = now()
                 WHERE ticker = $1 AND status NOT IN ('settled', 'determined')",
            )
            .bind(&event.market_ticker)
            .bind(event.effective_status())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for LifecycleWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let events: Vec<MarketLifecycleEvent> = parse_batch(topics::LIFECYCLE, entries);
        if events.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("lifecycle", || Self::flush(&pool, &events)).await?;

        self.total_written += events.len() as u64;
        debug!(count = events.len(), total = self.total_written, "lifecycle_flushed");
        Ok(())
    }
}
