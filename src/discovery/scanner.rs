//! Market discovery: periodic REST scans that maintain the markets, events,
//! and series metadata tables plus the state-store metadata hash.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::KalshiMarket;
use crate::rest::RestClient;
use crate::state::StateStore;

/// Outcome of one scan cycle, used to drive dynamic subscriptions.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub new_tickers: Vec<String>,
    pub closed_tickers: Vec<String>,
    pub total_active: usize,
}

pub struct MarketScanner {
    client: RestClient,
    pool: PgPool,
    state: StateStore,
    known_tickers: HashSet<String>,
}

impl MarketScanner {
    pub fn new(client: RestClient, pool: PgPool, state: StateStore) -> Self {
        Self {
            client,
            pool,
            state,
            known_tickers: HashSet::new(),
        }
    }

    /// Paginate through every open market, upsert metadata, refresh the
    /// state-store hash, and report which markets appeared or vanished.
    pub async fn scan_all_markets(&mut self) -> Result<ScanOutcome> {
        let mut all_markets: Vec<KalshiMarket> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .client
                .get_markets(Some("open"), cursor.as_deref())
                .await?;
            if page.markets.is_empty() {
                break;
            }
            all_markets.extend(page.markets);

            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        let current: HashSet<String> = all_markets.iter().map(|m| m.ticker.clone()).collect();
        let new_tickers: Vec<String> = current.difference(&self.known_tickers).cloned().collect();
        let closed_tickers: Vec<String> = self.known_tickers.difference(&current).cloned().collect();

        self.upsert_markets(&all_markets).await?;

        if let Err(e) = self.state.set_markets(&all_markets).await {
            warn!(error = %e, "market_cache_update_failed");
        }

        self.known_tickers = current;

        info!(
            new = new_tickers.len(),
            closed = closed_tickers.len(),
            total_active = self.known_tickers.len(),
            "market_scan_complete"
        );

        Ok(ScanOutcome {
            new_tickers,
            closed_tickers,
            total_active: self.known_tickers.len(),
        })
    }

    /// Populate the events table.
    pub async fn scan_events(&self) -> Result<()> {
        let mut cursor: Option<String> = None;

        loop {
            let page = self.client.get_events(cursor.as_deref()).await?;
            if page.events.is_empty() {
                break;
            }
            self.upsert_events(&page.events).await?;

            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        info!("event_scan_complete");
        Ok(())
    }

    /// Fetch and upsert series metadata for every series seen in markets.
    pub async fn scan_series(&self) -> Result<()> {
        let series_tickers: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT series_ticker FROM markets WHERE series_ticker != ''",
        )
        .fetch_all(&self.pool)
        .await?;

        for ticker in &series_tickers {
            match self.client.get_series(ticker).await {
                Ok(response) => {
                    if let Err(e) = self.upsert_series(ticker, &response.series).await {
                        error!(ticker = %ticker, error = %e, "series_upsert_error");
                    }
                }
                Err(e) => error!(ticker = %ticker, error = %e, "series_fetch_error"),
            }
        }

        info!(count = series_tickers.len(), "series_scan_complete");
        Ok(())
    }

    async fn upsert_markets(&self, markets: &[KalshiMarket]) -> Result<()> {
        if markets.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for market in markets {
            sqlx::query(
                "INSERT INTO markets (ticker, event_ticker, series_ticker, title, subtitle,
                     status, market_type, close_time, result, last_synced_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
                 ON CONFLICT (ticker) DO UPDATE SET
                     status = EXCLUDED.status,
                     close_time = EXCLUDED.close_time,
                     result = EXCLUDED.result,
                     last_synced_at = now()",
            )
            .bind(&market.ticker)
            .bind(&market.event_ticker)
            .bind(&market.series_ticker)
            .bind(&market.title)
            .bind(market.subtitle.as_deref())
            .bind(&market.status)
            .bind(&market.market_type)
            .bind(market.close_time)
            .bind(market.result.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_events(&self, events: &[serde_json::Value]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            let ticker = event.get("event_ticker").and_then(|v| v.as_str()).unwrap_or("");
            if ticker.is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO events (ticker, series_ticker, title, status, market_count, last_synced_at)
                 VALUES ($1, $2, $3, $4, $5, now())
                 ON CONFLICT (ticker) DO UPDATE SET
                     status = EXCLUDED.status,
                     market_count = EXCLUDED.market_count,
                     last_synced_at = now()",
            )
            .bind(ticker)
            .bind(event.get("series_ticker").and_then(|v| v.as_str()).unwrap_or(""))
            .bind(event.get("title").and_then(|v| v.as_str()).unwrap_or(""))
            .bind(event.get("status").and_then(|v| v.as_str()).unwrap_or(""))
            .bind(
                event
                    .get("markets")
                    .and_then(|v| v.as_array())
                    .map_or(0i64, |m| m.len() as i64),
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_series(&self, ticker: &str, series: &serde_json::Value) -> Result<()> {
        let tags: Vec<String> = series
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        sqlx::query(
            "INSERT INTO series (ticker, title, category, tags, last_synced_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (ticker) DO UPDATE SET
                 title = EXCLUDED.title,
                 category = EXCLUDED.category,
                 tags = EXCLUDED.tags,
                 last_synced_at = now()",
        )
        .bind(ticker)
        .bind(series.get("title").and_then(|v| v.as_str()).unwrap_or(""))
        .bind(series.get("category").and_then(|v| v.as_str()).unwrap_or(""))
        .bind(tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
