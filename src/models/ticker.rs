//! Ticker updates from the `ticker_v2` channel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A ticker update.
///
/// Every numeric field other than `price` is a signed delta since the last
/// update, and each update may carry only the subset of fields that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalshiTickerV2 {
    pub market_ticker: String,
    /// Last traded price in cents (0-99), if it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dollar_volume_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dollar_open_interest_delta: Option<i64>,
    /// Unix timestamp in seconds.
    pub ts: i64,
}

impl KalshiTickerV2 {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.ts, 0).single().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(price) = self.price
            && !(0..=99).contains(&price)
        {
            return Err(Error::Parse(format!(
                "ticker {}: price {} out of range",
                self.market_ticker, price
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_full_update() {
        let json = r#"{
            "market_ticker": "KXBTC-24DEC31-100000",
            "price": 45,
            "volume_delta": 12,
            "open_interest_delta": -3,
            "dollar_volume_delta": 540,
            "dollar_open_interest_delta": -135,
            "ts": 1704067200
        }"#;
        let ticker: KalshiTickerV2 = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.price, Some(45));
        assert_eq!(ticker.open_interest_delta, Some(-3));
        assert!(ticker.validate().is_ok());
    }

    #[test]
    fn test_ticker_partial_update() {
        // Updates may carry only the fields that changed.
        let json = r#"{"market_ticker": "M1", "open_interest_delta": 7, "ts": 1704067200}"#;
        let ticker: KalshiTickerV2 = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.price, None);
        assert_eq!(ticker.open_interest_delta, Some(7));
    }

    #[test]
    fn test_ticker_price_validation() {
        let json = r#"{"market_ticker": "M1", "price": 101, "ts": 1704067200}"#;
        let ticker: KalshiTickerV2 = serde_json::from_str(json).unwrap();
        assert!(ticker.validate().is_err());
    }
}
