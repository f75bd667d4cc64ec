//! Ticker writer: `kalshi:ticker_v2` -> `ticker_updates` table.
//!
//! Also refreshes the `state:ticker:{ticker}` cache that the price-snapshot
//! service reads first.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::KalshiTickerV2;
use crate::state::StateStore;

const CONSUMER_NAME: &str = "ticker_writer_1";
const BATCH_SIZE: usize = 100;

pub struct TickerWriter {
    pool: PgPool,
    state: StateStore,
    total_written: u64,
}

impl TickerWriter {
    pub fn new(pool: PgPool, state: StateStore) -> Self {
        Self {
            pool,
            state,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("ticker_writer_started");
        consumer
            .consume(topics::TICKER_V2, CONSUMER_GROUP, CONSUMER_NAME, BATCH_SIZE, &mut self)
            .await
    }

    async fn flush(pool: &PgPool, tickers: &[KalshiTickerV2]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for ticker in tickers {
            sqlx::query(
                "INSERT INTO ticker_updates (ts, market_ticker, price, volume_delta,
                     open_interest_delta, dollar_volume_delta, dollar_open_interest_delta)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(ticker.timestamp())
            .bind(&ticker.market_ticker)
            .bind(ticker.price)
            .bind(ticker.volume_delta)
            .bind(ticker.open_interest_delta)
            .bind(ticker.dollar_volume_delta)
            .bind(ticker.dollar_open_interest_delta)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Keep the last-known priced ticker per market for snapshot fallbacks.
    async fn refresh_ticker_cache(&self, tickers: &[KalshiTickerV2]) {
        for ticker in tickers {
            if ticker.price.is_none() {
                continue;
            }
            let payload = serde_json::json!({
                "price": ticker.price,
                "ts": ticker.ts,
            });
            if let Err(e) = self
                .state
                .set_last_ticker(&ticker.market_ticker, &payload)
                .await
            {
                warn!(ticker = %ticker.market_ticker, error = %e, "ticker_cache_update_failed");
            }
        }
    }
}

#[async_trait]
impl StreamHandler for TickerWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let tickers: Vec<KalshiTickerV2> = parse_batch(topics::TICKER_V2, entries);
        if tickers.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("tickers", || Self::flush(&pool, &tickers)).await?;
        self.refresh_ticker_cache(&tickers).await;

        self.total_written += tickers.len() as u64;
        debug!(count = tickers.len(), total = self.total_written, "tickers_flushed");
        Ok(())
    }
}
