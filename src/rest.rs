//! Authenticated, paginated REST client with cooperative rate limiting.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::AuthSigner;
use crate::error::{Error, Result};
use crate::models::{KalshiMarket, KalshiTrade};

const API_PREFIX: &str = "/trade-api/v2";
const DEFAULT_PAGE_LIMIT: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Rate-limit headers observed on the most recent response.
#[derive(Debug, Default, Clone, Copy)]
struct RateLimitState {
    remaining: Option<i64>,
    reset_epoch: Option<f64>,
}

impl RateLimitState {
    /// Seconds to wait before the next request, if the budget is exhausted.
    fn wait_seconds(&self, now_epoch: f64) -> Option<f64> {
        let remaining = self.remaining?;
        if remaining > 1 {
            return None;
        }
        let reset = self.reset_epoch?;
        let wait = reset - now_epoch;
        (wait > 0.0).then_some(wait)
    }
}

/// Keep-alive HTTPS client for the exchange REST API.
///
/// Every response's `X-RateLimit-Remaining` / `X-RateLimit-Reset` headers are
/// tracked; when the remaining budget drops to one, the next request sleeps
/// until the reset time. 4xx/5xx responses surface as [`Error::Rest`] and
/// callers decide whether to retry.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    signer: AuthSigner,
    base_url: String,
    rate_limit: Arc<Mutex<RateLimitState>>,
}

impl RestClient {
    pub fn new(signer: AuthSigner, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            signer,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limit: Arc::new(Mutex::new(RateLimitState::default())),
        })
    }

    /// GET `path` (already including the API prefix) and deserialize JSON.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.throttle().await;

        // The signature covers the path without query parameters.
        let sign_path = path.split('?').next().unwrap_or(path);
        let auth = self.signer.sign_rest("GET", sign_path);

        let url = format!("{}{}", self.base_url, path);
        let mut headers = HeaderMap::new();
        for (name, value) in auth.pairs() {
            headers.insert(
                name,
                value
                    .parse()
                    .map_err(|e| Error::InvalidHeaderValue(format!("{name}: {e}")))?,
            );
        }

        let response = self.client.get(&url).headers(headers).send().await?;
        self.observe_rate_limit(response.headers()).await;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Rest { status, body });
        }

        Ok(response.json::<T>().await?)
    }

    /// Sleep until the rate-limit window resets when the budget is exhausted.
    async fn throttle(&self) {
        let wait = {
            let state = self.rate_limit.lock().await;
            state.wait_seconds(epoch_now())
        };
        if let Some(wait) = wait {
            warn!(wait_seconds = wait, "rate_limit_wait");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    async fn observe_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = header_number::<i64>(headers, "X-RateLimit-Remaining");
        let reset = header_number::<f64>(headers, "X-RateLimit-Reset");
        if remaining.is_none() && reset.is_none() {
            return;
        }
        let mut state = self.rate_limit.lock().await;
        if remaining.is_some() {
            state.remaining = remaining;
        }
        if reset.is_some() {
            state.reset_epoch = reset;
        }
    }

    // ── Endpoints ─────────────────────────────────────────────────────

    /// `GET /trade-api/v2/markets`
    pub async fn get_markets(
        &self,
        status: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<MarketsPage> {
        let mut query = QueryBuilder::new();
        query.push("limit", DEFAULT_PAGE_LIMIT);
        query.push_opt("status", status);
        query.push_opt("cursor", cursor);
        self.get(&format!("{API_PREFIX}/markets{}", query.build()))
            .await
    }

    /// `GET /trade-api/v2/markets/{ticker}`
    pub async fn get_market(&self, ticker: &str) -> Result<MarketResponse> {
        self.get(&format!("{API_PREFIX}/markets/{ticker}")).await
    }

    /// `GET /trade-api/v2/markets/{ticker}/trades`
    pub async fn get_trades(
        &self,
        ticker: &str,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
        cursor: Option<&str>,
    ) -> Result<TradesPage> {
        let mut query = QueryBuilder::new();
        query.push("limit", DEFAULT_PAGE_LIMIT);
        query.push_opt("min_ts", min_ts);
        query.push_opt("max_ts", max_ts);
        query.push_opt("cursor", cursor);
        self.get(&format!("{API_PREFIX}/markets/{ticker}/trades{}", query.build()))
            .await
    }

    /// `GET /trade-api/v2/events`
    pub async fn get_events(&self, cursor: Option<&str>) -> Result<EventsPage> {
        let mut query = QueryBuilder::new();
        query.push("limit", DEFAULT_PAGE_LIMIT);
        query.push_opt("cursor", cursor);
        self.get(&format!("{API_PREFIX}/events{}", query.build()))
            .await
    }

    /// `GET /trade-api/v2/series/{ticker}`
    pub async fn get_series(&self, ticker: &str) -> Result<SeriesResponse> {
        self.get(&format!("{API_PREFIX}/series/{ticker}")).await
    }

    /// `GET /trade-api/v2/series/{series}/markets/{ticker}/candlesticks`
    pub async fn get_candlesticks(
        &self,
        series_ticker: &str,
        ticker: &str,
        period_interval_minutes: i64,
    ) -> Result<CandlesticksPage> {
        let mut query = QueryBuilder::new();
        query.push("period_interval", period_interval_minutes);
        self.get(&format!(
            "{API_PREFIX}/series/{series_ticker}/markets/{ticker}/candlesticks{}",
            query.build()
        ))
        .await
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn header_number<T: std::str::FromStr>(headers: &reqwest::header::HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// ── Response pages ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsPage {
    #[serde(default)]
    pub markets: Vec<KalshiMarket>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketResponse {
    pub market: KalshiMarket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradesPage {
    #[serde(default)]
    pub trades: Vec<RestTrade>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// A trade as returned by the REST trades endpoint (ISO timestamp, `ticker`
/// field name). Converted to [`KalshiTrade`] for the idempotent insert path.
#[derive(Debug, Clone, Deserialize)]
pub struct RestTrade {
    pub trade_id: String,
    pub ticker: String,
    pub yes_price: i64,
    pub no_price: i64,
    pub count: i64,
    pub taker_side: crate::models::Side,
    pub created_time: chrono::DateTime<chrono::Utc>,
}

impl From<RestTrade> for KalshiTrade {
    fn from(t: RestTrade) -> Self {
        KalshiTrade {
            trade_id: t.trade_id,
            market_ticker: t.ticker,
            yes_price: t.yes_price,
            no_price: t.no_price,
            count: t.count,
            taker_side: t.taker_side,
            ts: t.created_time.timestamp(),
            yes_price_dollars: None,
            no_price_dollars: None,
            count_fp: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsPage {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesResponse {
    #[serde(default)]
    pub series: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandlesticksPage {
    #[serde(default)]
    pub candlesticks: Vec<serde_json::Value>,
}

// ── Query builder ─────────────────────────────────────────────────────

/// Helper to build URL query strings with proper encoding.
struct QueryBuilder {
    pairs: Vec<(String, String)>,
}

impl QueryBuilder {
    fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    fn push(&mut self, key: &str, value: impl ToString) {
        self.pairs.push((key.to_string(), value.to_string()));
    }

    fn push_opt<T: ToString>(&mut self, key: &str, value: Option<T>) {
        if let Some(v) = value {
            self.push(key, v);
        }
    }

    fn build(self) -> String {
        if self.pairs.is_empty() {
            return String::new();
        }
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs)
            .finish();
        format!("?{}", encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let mut query = QueryBuilder::new();
        query.push("limit", 200);
        query.push_opt("status", Some("open"));
        query.push_opt::<&str>("cursor", None);
        assert_eq!(query.build(), "?limit=200&status=open");
    }

    #[test]
    fn test_query_builder_empty() {
        assert_eq!(QueryBuilder::new().build(), "");
    }

    #[test]
    fn test_query_builder_encodes_values() {
        let mut query = QueryBuilder::new();
        query.push("cursor", "a b&c");
        assert_eq!(query.build(), "?cursor=a+b%26c");
    }

    #[test]
    fn test_rate_limit_wait() {
        let state = RateLimitState {
            remaining: Some(1),
            reset_epoch: Some(1_000.5),
        };
        assert_eq!(state.wait_seconds(1_000.0), Some(0.5));
        // Budget still available.
        let state = RateLimitState {
            remaining: Some(50),
            reset_epoch: Some(1_000.5),
        };
        assert_eq!(state.wait_seconds(1_000.0), None);
        // Reset already in the past.
        let state = RateLimitState {
            remaining: Some(0),
            reset_epoch: Some(999.0),
        };
        assert_eq!(state.wait_seconds(1_000.0), None);
        // No headers observed yet.
        assert_eq!(RateLimitState::default().wait_seconds(1_000.0), None);
    }

    #[test]
    fn test_rest_trade_conversion() {
        let json = r#"{
            "trade_id": "T1",
            "ticker": "KXBTC-24DEC31-100000",
            "yes_price": 36,
            "no_price": 64,
            "count": 10,
            "taker_side": "yes",
            "created_time": "2023-11-14T22:13:20Z"
        }"#;
        let rest: RestTrade = serde_json::from_str(json).unwrap();
        let trade: KalshiTrade = rest.into();
        assert_eq!(trade.market_ticker, "KXBTC-24DEC31-100000");
        assert_eq!(trade.ts, 1700000000);
        assert!(trade.validate().is_ok());
    }
}
