//! Public trade messages from the `trade` channel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::Side;
use crate::error::{Error, Result};

/// A single public trade.
///
/// `trade_id` uniquely identifies the trade; database inserts are idempotent
/// on it. `yes_price + no_price` need not equal 100 because the trade prints
/// on one side only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalshiTrade {
    pub trade_id: String,
    /// REST responses name this field `ticker`.
    #[serde(alias = "ticker")]
    pub market_ticker: String,
    /// Yes side price in cents (0-99).
    pub yes_price: i64,
    /// No side price in cents (0-99).
    pub no_price: i64,
    /// Number of contracts traded.
    pub count: i64,
    /// Side that took liquidity.
    pub taker_side: Side,
    /// Unix timestamp in seconds.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_price_dollars: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_price_dollars: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_fp: Option<String>,
}

impl KalshiTrade {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.ts, 0).single().unwrap_or_default()
    }

    /// Enforce the trade invariants the exchange guarantees.
    pub fn validate(&self) -> Result<()> {
        if !(0..=99).contains(&self.yes_price) {
            return Err(Error::Parse(format!(
                "trade {}: yes_price {} out of range",
                self.trade_id, self.yes_price
            )));
        }
        if !(0..=99).contains(&self.no_price) {
            return Err(Error::Parse(format!(
                "trade {}: no_price {} out of range",
                self.trade_id, self.no_price
            )));
        }
        if self.count < 1 {
            return Err(Error::Parse(format!(
                "trade {}: count {} below 1",
                self.trade_id, self.count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_json() -> &'static str {
        r#"{
            "trade_id": "X1",
            "market_ticker": "KXBTC-24DEC31-100000",
            "yes_price": 36,
            "no_price": 64,
            "count": 10,
            "taker_side": "yes",
            "ts": 1700000000
        }"#
    }

    #[test]
    fn test_trade_deserialization() {
        let trade: KalshiTrade = serde_json::from_str(trade_json()).unwrap();
        assert_eq!(trade.trade_id, "X1");
        assert_eq!(trade.yes_price, 36);
        assert_eq!(trade.no_price, 64);
        assert_eq!(trade.count, 10);
        assert_eq!(trade.taker_side, Side::Yes);
        assert!(trade.validate().is_ok());
    }

    #[test]
    fn test_trade_rest_ticker_alias() {
        let json = r#"{
            "trade_id": "X2",
            "ticker": "KXBTC-24DEC31-100000",
            "yes_price": 50,
            "no_price": 50,
            "count": 1,
            "taker_side": "no",
            "ts": 1700000001
        }"#;
        let trade: KalshiTrade = serde_json::from_str(json).unwrap();
        assert_eq!(trade.market_ticker, "KXBTC-24DEC31-100000");
    }

    #[test]
    fn test_trade_round_trip() {
        let trade: KalshiTrade = serde_json::from_str(trade_json()).unwrap();
        let encoded = serde_json::to_string(&trade).unwrap();
        let restored: KalshiTrade = serde_json::from_str(&encoded).unwrap();
        assert_eq!(trade, restored);
    }

    #[test]
    fn test_trade_validation_rejects_bad_prices() {
        let mut trade: KalshiTrade = serde_json::from_str(trade_json()).unwrap();
        trade.yes_price = 120;
        assert!(trade.validate().is_err());

        let mut trade: KalshiTrade = serde_json::from_str(trade_json()).unwrap();
        trade.count = 0;
        assert!(trade.validate().is_err());
    }
}
