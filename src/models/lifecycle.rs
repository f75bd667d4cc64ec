//! Lifecycle events from the `market_lifecycle_v2` and `event_lifecycle` channels.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A market lifecycle state change.
///
/// The wire schema varies by `event_type` and the exchange adds fields over
/// time, so everything beyond the ticker is optional and unknown fields are
/// accepted. Lifecycle transitions are monotonic per market
/// (open -> closed -> settled); `settled`/`determined` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLifecycleEvent {
    pub market_ticker: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub market_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub determination_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl MarketLifecycleEvent {
    /// Best-effort timestamp from whichever field is present.
    pub fn timestamp(&self) -> DateTime<Utc> {
        for secs in [self.ts, self.determination_ts, self.close_ts, self.open_ts] {
            if let Some(secs) = secs
                && let Some(dt) = Utc.timestamp_opt(secs, 0).single()
            {
                return dt;
            }
        }
        Utc::now()
    }

    /// Status for the `markets` table: `status` when present, else `event_type`.
    pub fn effective_status(&self) -> &str {
        if !self.status.is_empty() {
            &self.status
        } else if !self.event_type.is_empty() {
            &self.event_type
        } else {
            "unknown"
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.effective_status(), "settled" | "determined")
    }
}

/// An event-level lifecycle message (new event creation, etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLifecycleEvent {
    pub event_ticker: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub collateral_return_type: String,
    #[serde(default)]
    pub series_ticker: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_accepts_unknown_fields() {
        let json = r#"{
            "market_ticker": "M1",
            "event_type": "determined",
            "determination_ts": 1700000500,
            "result": "yes",
            "brand_new_field": {"nested": true}
        }"#;
        let event: MarketLifecycleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "determined");
        assert_eq!(event.result, "yes");
        assert_eq!(event.timestamp().timestamp(), 1700000500);
    }

    #[test]
    fn test_effective_status_prefers_status_field() {
        let event = MarketLifecycleEvent {
            market_ticker: "M1".into(),
            event_type: "closed".into(),
            market_id: String::new(),
            status: "settled".into(),
            result: String::new(),
            open_ts: None,
            close_ts: None,
            determination_ts: None,
            ts: None,
        };
        assert_eq!(event.effective_status(), "settled");
        assert!(event.is_terminal());
    }

    #[test]
    fn test_effective_status_falls_back_to_event_type() {
        let json = r#"{"market_ticker": "M1", "event_type": "open"}"#;
        let event: MarketLifecycleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.effective_status(), "open");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_timestamp_fallback_order() {
        let event: MarketLifecycleEvent = serde_json::from_str(
            r#"{"market_ticker": "M1", "ts": 100, "close_ts": 200}"#,
        )
        .unwrap();
        assert_eq!(event.timestamp().timestamp(), 100);

        let event: MarketLifecycleEvent =
            serde_json::from_str(r#"{"market_ticker": "M1", "close_ts": 200}"#).unwrap();
        assert_eq!(event.timestamp().timestamp(), 200);
    }
}
