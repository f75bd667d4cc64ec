//! Market metadata from the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market metadata, uniquely keyed by `ticker`; refreshed on scan cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalshiMarket {
    pub ticker: String,
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: String,
    #[serde(default)]
    pub market_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// "open", "closed", "settled", ...
    #[serde(default)]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_bid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_ask: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl KalshiMarket {
    /// Terminal statuses never transition back to open.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "settled" | "determined")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_deserialization_tolerates_extra_fields() {
        let json = r#"{
            "ticker": "KXBTC-24DEC31-100000",
            "event_ticker": "KXBTC-24DEC31",
            "series_ticker": "KXBTC",
            "market_type": "binary",
            "title": "Bitcoin above $100,000?",
            "subtitle": "Above $100,000",
            "status": "open",
            "last_price": 45,
            "liquidity": 123456,
            "notional_value": 100
        }"#;
        let market: KalshiMarket = serde_json::from_str(json).unwrap();
        assert_eq!(market.ticker, "KXBTC-24DEC31-100000");
        assert_eq!(market.subtitle.as_deref(), Some("Above $100,000"));
        assert!(!market.is_terminal());
    }

    #[test]
    fn test_terminal_status() {
        let json = r#"{"ticker": "M1", "event_ticker": "E1", "status": "settled"}"#;
        let market: KalshiMarket = serde_json::from_str(json).unwrap();
        assert!(market.is_terminal());
    }
}
