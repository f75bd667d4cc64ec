//! Composite writer: `kalshi:signals:composite` -> `composite_log` table.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::CompositeSignal;

const CONSUMER_NAME: &str = "composite_writer_1";
const BATCH_SIZE: usize = 50;

pub struct CompositeWriter {
    pool: PgPool,
    total_written: u64,
}

impl CompositeWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("composite_writer_started");
        consumer
            .consume(
                topics::SIGNALS_COMPOSITE,
                CONSUMER_GROUP,
                CONSUMER_NAME,
                BATCH_SIZE,
                &mut self,
            )
            .await
    }

    async fn flush(
        pool: &PgPool,
        composites: &[CompositeSignal],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for composite in composites {
            let signal_ids: Vec<String> = composite
                .active_signals
                .iter()
                .map(|s| s.signal_id.clone())
                .collect();

            sqlx::query(
                "INSERT INTO composite_log (ts, market_ticker, event_ticker, series_ticker,
                     direction, composite_score, regime, active_signal_count, active_signal_ids)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(composite.ts)
            .bind(&composite.market_ticker)
            .bind(composite.event_ticker.as_deref())
            .bind(composite.series_ticker.as_deref())
            .bind(composite.direction.as_str())
            .bind(composite.composite_score)
            .bind(composite.regime.as_str())
            .bind(composite.active_signals.len() as i64)
            .bind(signal_ids)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for CompositeWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let composites: Vec<CompositeSignal> = parse_batch(topics::SIGNALS_COMPOSITE, entries);
        if composites.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("composites", || Self::flush(&pool, &composites)).await?;

        self.total_written += composites.len() as u64;
        debug!(count = composites.len(), total = self.total_written, "composites_flushed");
        Ok(())
    }
}
