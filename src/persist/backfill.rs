//! REST-based gap filling with idempotent inserts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};

use super::gap::Gap;
use crate::error::Result;
use crate::models::KalshiTrade;
use crate::rest::RestClient;

/// Inter-page sleep to respect REST rate limits.
const PAGE_DELAY: Duration = Duration::from_millis(500);

pub struct Backfiller {
    client: RestClient,
    pool: PgPool,
}

impl Backfiller {
    pub fn new(client: RestClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Fetch trades for a window via paginated REST and insert them with the
    /// same idempotent policy as the live writer. Returns the fetched count;
    /// re-running over an already-persisted window inserts zero new rows.
    pub async fn backfill_trades(
        &self,
        market_ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut cursor: Option<String> = None;

        loop {
            let page = match self
                .client
                .get_trades(
                    market_ticker,
                    Some(start.timestamp()),
                    Some(end.timestamp()),
                    cursor.as_deref(),
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(market_ticker, error = %e, "backfill_fetch_error");
                    break;
                }
            };

            if page.trades.is_empty() {
                break;
            }

            let mut trades = Vec::with_capacity(page.trades.len());
            for raw in page.trades {
                let trade: KalshiTrade = raw.into();
                match trade.validate() {
                    Ok(()) => trades.push(trade),
                    Err(e) => warn!(error = %e, "backfill_trade_parse_error"),
                }
            }

            if !trades.is_empty() {
                self.insert_trades(&trades).await?;
                total += trades.len() as u64;
            }

            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }

            tokio::time::sleep(PAGE_DELAY).await;
        }

        info!(
            market_ticker,
            start = %start,
            end = %end,
            records = total,
            "backfill_complete"
        );
        Ok(total)
    }

    /// Candlestick fallback when trade-level data is not available. Returns
    /// the number of candles fetched.
    pub async fn backfill_candlesticks(
        &self,
        series_ticker: &str,
        market_ticker: &str,
        period_interval_minutes: i64,
    ) -> Result<u64> {
        let page = match self
            .client
            .get_candlesticks(series_ticker, market_ticker, period_interval_minutes)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(market_ticker, error = %e, "backfill_candlestick_error");
                return Ok(0);
            }
        };

        info!(market_ticker, candles = page.candlesticks.len(), "candlestick_backfill");
        Ok(page.candlesticks.len() as u64)
    }

    /// Backfill every detected gap. Returns per-market fetched counts.
    pub async fn backfill_gaps(&self, gaps: &[(String, Vec<Gap>)]) -> Result<Vec<(String, u64)>> {
        let mut results = Vec::new();

        for (ticker, ranges) in gaps {
            let mut total = 0u64;
            for (gap_start, gap_end) in ranges {
                total += self.backfill_trades(ticker, *gap_start, *gap_end).await?;
            }
            results.push((ticker.clone(), total));
        }

        info!(
            markets = results.len(),
            total_records = results.iter().map(|(_, n)| n).sum::<u64>(),
            "gap_backfill_complete"
        );
        Ok(results)
    }

    async fn insert_trades(&self, trades: &[KalshiTrade]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
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
        tx.commit().await?;
        Ok(())
    }
}
