//! State store: the authoritative in-memory view of orderbooks, regimes,
//! market metadata, and component health, kept in the shared key/value cache.
//!
//! All orderbook reads/writes are single-operation atomic gets and sets; no
//! transaction is needed because each ticker's delta stream has a single
//! producer and consumers only read.

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{KalshiMarket, OrderbookDelta, OrderbookSnapshot, OrderbookState, RegimeSnapshot};

pub const KEY_ORDERBOOK_PREFIX: &str = "state:orderbook:";
pub const KEY_TICKER_PREFIX: &str = "state:ticker:";
pub const KEY_REGIME_PREFIX: &str = "state:regime:";
pub const KEY_MARKETS: &str = "meta:markets";
pub const KEY_SERIES_PREFIX: &str = "meta:series:";
pub const KEY_HEALTH_PREFIX: &str = "health:";

pub const REGIME_TTL_SECONDS: u64 = 120;
pub const MARKETS_TTL_SECONDS: i64 = 300;
pub const SERIES_TTL_SECONDS: u64 = 300;
pub const HEALTH_TTL_SECONDS: u64 = 60;

fn orderbook_key(ticker: &str) -> String {
    format!("{KEY_ORDERBOOK_PREFIX}{ticker}")
}

fn ticker_key(ticker: &str) -> String {
    format!("{KEY_TICKER_PREFIX}{ticker}")
}

fn regime_key(ticker: &str) -> String {
    format!("{KEY_REGIME_PREFIX}{ticker}")
}

fn series_key(ticker: &str) -> String {
    format!("{KEY_SERIES_PREFIX}{ticker}")
}

fn health_key(component: &str) -> String {
    format!("{KEY_HEALTH_PREFIX}{component}")
}

/// Shared key/value store handle. Cheap to clone; every operation clones the
/// multiplexed connection.
#[derive(Clone)]
pub struct StateStore {
    conn: MultiplexedConnection,
}

impl StateStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        conn.set::<_, _, ()>(key, payload).await?;
        Ok(())
    }

    async fn set_json_ex<T: Serialize>(&self, key: &str, value: &T, ttl: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        conn.set_ex::<_, _, ()>(key, payload, ttl).await?;
        Ok(())
    }

    // ── Orderbook state ───────────────────────────────────────────────

    /// Replace the entire book for a market with a fresh snapshot.
    pub async fn apply_snapshot(&self, snapshot: &OrderbookSnapshot) -> Result<()> {
        let book = OrderbookState::from_snapshot(snapshot);
        self.set_json(&orderbook_key(&snapshot.market_ticker), &book)
            .await?;
        debug!(ticker = %snapshot.market_ticker, "orderbook_snapshot_applied");
        Ok(())
    }

    /// Apply an incremental change to the stored book.
    ///
    /// A delta arriving before any snapshot is dropped with a warning; the
    /// next snapshot re-synchronises the book.
    pub async fn apply_delta(&self, delta: &OrderbookDelta) -> Result<()> {
        let key = orderbook_key(&delta.market_ticker);
        let Some(mut book) = self.get_json::<OrderbookState>(&key).await? else {
            warn!(ticker = %delta.market_ticker, "orderbook_delta_no_snapshot");
            return Ok(());
        };

        book.apply_delta(delta);
        self.set_json(&key, &book).await
    }

    /// The current reconstructed book for a market.
    pub async fn current_book(&self, ticker: &str) -> Result<Option<OrderbookState>> {
        self.get_json(&orderbook_key(ticker)).await
    }

    /// `100 - best_yes_bid - best_no_bid`, when both sides have depth.
    pub async fn spread(&self, ticker: &str) -> Result<Option<i64>> {
        Ok(self.current_book(ticker).await?.and_then(|b| b.spread()))
    }

    /// `(best_yes_bid + (100 - best_no_bid)) / 2`, when both sides have depth.
    pub async fn midpoint(&self, ticker: &str) -> Result<Option<f64>> {
        Ok(self.current_book(ticker).await?.and_then(|b| b.midpoint()))
    }

    /// Tickers that currently have a stored orderbook.
    pub async fn orderbook_tickers(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_ORDERBOOK_PREFIX}*");
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_ORDERBOOK_PREFIX).map(str::to_string))
            .collect())
    }

    // ── Ticker state ──────────────────────────────────────────────────

    /// Cache the latest ticker fields for a market (used by price snapshots).
    pub async fn set_last_ticker(&self, ticker: &str, payload: &serde_json::Value) -> Result<()> {
        self.set_json(&ticker_key(ticker), payload).await
    }

    pub async fn last_ticker(&self, ticker: &str) -> Result<Option<serde_json::Value>> {
        self.get_json(&ticker_key(ticker)).await
    }

    // ── Regime state ──────────────────────────────────────────────────

    pub async fn set_regime(&self, ticker: &str, snapshot: &RegimeSnapshot) -> Result<()> {
        self.set_json_ex(&regime_key(ticker), snapshot, REGIME_TTL_SECONDS)
            .await
    }

    pub async fn regime(&self, ticker: &str) -> Result<Option<RegimeSnapshot>> {
        self.get_json(&regime_key(ticker)).await
    }

    // ── Market metadata ───────────────────────────────────────────────

    /// Replace the market-metadata hash with the latest scan results.
    pub async fn set_markets(&self, markets: &[KalshiMarket]) -> Result<()> {
        if markets.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pairs = Vec::with_capacity(markets.len());
        for market in markets {
            pairs.push((market.ticker.clone(), serde_json::to_string(market)?));
        }
        conn.del::<_, ()>(KEY_MARKETS).await?;
        conn.hset_multiple::<_, _, _, ()>(KEY_MARKETS, &pairs).await?;
        conn.expire::<_, ()>(KEY_MARKETS, MARKETS_TTL_SECONDS).await?;
        Ok(())
    }

    pub async fn market(&self, ticker: &str) -> Result<Option<KalshiMarket>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(KEY_MARKETS, ticker).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Cache a series -> events -> markets sub-graph.
    pub async fn set_series_graph(&self, series_ticker: &str, graph: &serde_json::Value) -> Result<()> {
        self.set_json_ex(&series_key(series_ticker), graph, SERIES_TTL_SECONDS)
            .await
    }

    // ── Health ────────────────────────────────────────────────────────

    pub async fn set_health(&self, component: &str, record: &serde_json::Value) -> Result<()> {
        self.set_json_ex(&health_key(component), record, HEALTH_TTL_SECONDS)
            .await
    }

    /// Round-trip latency probe in milliseconds.
    pub async fn ping(&self) -> Result<f64> {
        let mut conn = self.conn.clone();
        let start = std::time::Instant::now();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_patterns() {
        assert_eq!(orderbook_key("M1"), "state:orderbook:M1");
        assert_eq!(ticker_key("M1"), "state:ticker:M1");
        assert_eq!(regime_key("M1"), "state:regime:M1");
        assert_eq!(series_key("KXBTC"), "meta:series:KXBTC");
        assert_eq!(health_key("redis"), "health:redis");
    }

    #[test]
    fn test_ttl_constants() {
        assert_eq!(REGIME_TTL_SECONDS, 120);
        assert_eq!(MARKETS_TTL_SECONDS, 300);
        assert_eq!(HEALTH_TTL_SECONDS, 60);
    }
}
