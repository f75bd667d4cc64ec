//! Series -> event -> market relationship lookups.
//!
//! Cross-market propagation and settlement cascades both need to know which
//! markets share an event.

use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::Result;
use crate::state::StateStore;

#[derive(Clone)]
pub struct SeriesMapper {
    pool: PgPool,
    state: StateStore,
}

impl SeriesMapper {
    pub fn new(pool: PgPool, state: StateStore) -> Self {
        Self { pool, state }
    }

    /// All other markets in the same event as `ticker`.
    pub async fn get_related_markets(&self, ticker: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT m2.ticker FROM markets m1
             JOIN markets m2 ON m1.event_ticker = m2.event_ticker
             WHERE m1.ticker = $1 AND m2.ticker != $1",
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All markets for an event.
    pub async fn get_event_markets(&self, event_ticker: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT ticker FROM markets WHERE event_ticker = $1")
            .bind(event_ticker)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// All events in a series.
    pub async fn get_series_events(&self, series_ticker: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT ticker FROM events WHERE series_ticker = $1")
            .bind(series_ticker)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// The owning event ticker for a market, if known.
    pub async fn event_ticker_for(&self, ticker: &str) -> Result<Option<String>> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT event_ticker FROM markets WHERE ticker = $1")
                .bind(ticker)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Title and subtitle for a market (threshold parsing input).
    pub async fn market_text(&self, ticker: &str) -> Result<Option<(String, Option<String>)>> {
        let row = sqlx::query("SELECT title, subtitle FROM markets WHERE ticker = $1")
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("title"), r.get("subtitle"))))
    }

    /// Build the full series -> events -> markets graph over open markets and
    /// cache one sub-graph per series in the state store.
    pub async fn build_market_graph(&self) -> Result<Map<String, Value>> {
        let rows = sqlx::query(
            "SELECT series_ticker, event_ticker, ticker
             FROM markets WHERE status = 'open'
             ORDER BY series_ticker, event_ticker, ticker",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut graph: Map<String, Value> = Map::new();
        for row in rows {
            let series: String = row.get("series_ticker");
            let event: String = row.get("event_ticker");
            let ticker: String = row.get("ticker");

            let events = graph
                .entry(series)
                .or_insert_with(|| serde_json::json!({ "events": {} }));
            let markets = events["events"]
                .as_object_mut()
                .expect("events is an object")
                .entry(event)
                .or_insert_with(|| serde_json::json!({ "markets": [] }));
            markets["markets"]
                .as_array_mut()
                .expect("markets is an array")
                .push(Value::String(ticker));
        }

        for (series_ticker, data) in &graph {
            self.state.set_series_graph(series_ticker, data).await?;
        }

        info!(series_count = graph.len(), "market_graph_built");
        Ok(graph)
    }
}
