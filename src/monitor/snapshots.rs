//! Periodic price snapshots for after-the-fact signal validation.
//!
//! Every cycle, markets with trades in the last four hours get one row in
//! `price_snapshots`. The price source degrades in order: last cached ticker,
//! orderbook midpoint, last trade from the database. Markets with no price at
//! all are skipped.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::state::StateStore;

const SNAPSHOT_INTERVAL_SECONDS: u64 = 30;

/// One assembled snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PriceSnapshot {
    pub ts: DateTime<Utc>,
    pub market_ticker: String,
    pub yes_price: i64,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub spread: Option<i64>,
    pub volume_24h: Option<i64>,
    pub open_interest: Option<i64>,
}

pub struct PriceSnapshotService {
    state: StateStore,
    pool: PgPool,
    total_snapshots: u64,
}

impl PriceSnapshotService {
    pub fn new(state: StateStore, pool: PgPool) -> Self {
        Self {
            state,
            pool,
            total_snapshots: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(interval_seconds = SNAPSHOT_INTERVAL_SECONDS, "price_snapshot_service_started");
        let mut timer =
            tokio::time::interval(std::time::Duration::from_secs(SNAPSHOT_INTERVAL_SECONDS));

        loop {
            timer.tick().await;
            if let Err(e) = self.take_snapshots().await {
                error!(error = %e, "snapshot_cycle_error");
            }
        }
    }

    async fn take_snapshots(&mut self) -> Result<()> {
        let tickers = self.active_tickers().await?;
        if tickers.is_empty() {
            debug!("no_markets_for_snapshots");
            return Ok(());
        }

        let now = Utc::now();
        let mut rows = Vec::new();
        for ticker in &tickers {
            match self.build_snapshot(ticker, now).await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => debug!(ticker = %ticker, error = %e, "snapshot_build_error"),
            }
        }

        if rows.is_empty() {
            return Ok(());
        }

        self.flush(&rows).await?;
        self.total_snapshots += rows.len() as u64;
        debug!(count = rows.len(), total = self.total_snapshots, "snapshots_taken");
        Ok(())
    }

    /// Markets with recent trade activity.
    async fn active_tickers(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT market_ticker FROM trades
             WHERE ts > now() - INTERVAL '4 hours'
             ORDER BY market_ticker",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn build_snapshot(
        &self,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PriceSnapshot>> {
        // First choice: the last cached ticker price.
        let mut yes_price: Option<i64> = None;
        if let Some(cached) = self.state.last_ticker(ticker).await? {
            yes_price = cached.get("price").and_then(|v| v.as_i64());
        }

        // Orderbook-derived bid/ask/spread, and the midpoint fallback.
        let mut yes_bid = None;
        let mut yes_ask = None;
        let mut spread = None;
        if let Some(book) = self.state.current_book(ticker).await? {
            yes_bid = book.best_yes_bid();
            yes_ask = book.best_no_bid().map(|no_bid| 100 - no_bid);
            if let (Some(bid), Some(ask)) = (yes_bid, yes_ask) {
                spread = Some(ask - bid);
            }
            if yes_price.is_none()
                && let Some(midpoint) = book.midpoint()
            {
                yes_price = Some(midpoint.round() as i64);
            }
        }

        // Last resort: the most recent persisted trade.
        if yes_price.is_none() {
            yes_price = sqlx::query_scalar(
                "SELECT yes_price FROM trades
                 WHERE market_ticker = $1
                 ORDER BY ts DESC LIMIT 1",
            )
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        }

        let Some(yes_price) = yes_price else {
            return Ok(None);
        };

        Ok(Some(PriceSnapshot {
            ts: now,
            market_ticker: ticker.to_string(),
            yes_price,
            yes_bid,
            yes_ask,
            spread,
            volume_24h: None,
            open_interest: None,
        }))
    }

    async fn flush(&self, rows: &[PriceSnapshot]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO price_snapshots (ts, market_ticker, yes_price, yes_bid, yes_ask,
                     spread, volume_24h, open_interest)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(row.ts)
            .bind(&row.market_ticker)
            .bind(row.yes_price)
            .bind(row.yes_bid)
            .bind(row.yes_ask)
            .bind(row.spread)
            .bind(row.volume_24h)
            .bind(row.open_interest)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
