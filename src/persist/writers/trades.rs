//! Trade writer: `kalshi:trades` -> `trades` table.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::KalshiTrade;

const CONSUMER_NAME: &str = "trade_writer_1";

/// Batch-inserts trades, idempotent on `trade_id`.
pub struct TradeWriter {
    pool: PgPool,
    batch_size: usize,
    total_written: u64,
}

impl TradeWriter {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("trade_writer_started");
        let batch_size = self.batch_size;
        consumer
            .consume(topics::TRADES, CONSUMER_GROUP, CONSUMER_NAME, batch_size, &mut self)
            .await
    }

    async fn flush(pool: &PgPool, trades: &[KalshiTrade]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for trade in trades {
            sqlx::query(
                "INSERT INTO trades (ts, trade_id, market_ticker, yes_price, no_price, count, taker_side)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (trade_id) DO NOTHING",
            )
            .bind(trade.timestamp())
            .bind(&trade.trade_id)
            .bind(&trade.market_ticker)
            .bind(trade.yes_price)
            .bind(trade.no_price)
            .bind(trade.count)
            .bind(trade.taker_side.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for TradeWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let trades: Vec<KalshiTrade> = parse_batch(topics::TRADES, entries);
        if trades.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("trades", || Self::flush(&pool, &trades)).await?;

        self.total_written += trades.len() as u64;
        debug!(count = trades.len(), total = self.total_written, "trades_flushed");
        Ok(())
    }
}
