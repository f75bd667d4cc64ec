//! Signal models: the shared contract between processors, the aggregator,
//! and the signal writers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Microstructure regime classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    /// Wide spread, no activity.
    Dead,
    /// Some depth, low message rate.
    Quiet,
    /// Tightening spread, building depth.
    Active,
    /// One-sided sweep, depth evaporating.
    Informed,
    /// Converging toward 0 or 100.
    #[serde(rename = "pre_settle")]
    PreSettlement,
    #[default]
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Dead => "dead",
            MarketRegime::Quiet => "quiet",
            MarketRegime::Active => "active",
            MarketRegime::Informed => "informed",
            MarketRegime::PreSettlement => "pre_settle",
            MarketRegime::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    BuyYes,
    BuyNo,
    Neutral,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::BuyYes => "buy_yes",
            SignalDirection::BuyNo => "buy_no",
            SignalDirection::Neutral => "neutral",
        }
    }

    /// Multiplier used by the composite computation.
    pub fn multiplier(&self) -> f64 {
        match self {
            SignalDirection::BuyYes => 1.0,
            SignalDirection::BuyNo => -1.0,
            SignalDirection::Neutral => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalUrgency {
    /// Act now, edge is fleeting.
    Immediate,
    /// Developing, monitor for confirmation.
    Watch,
    /// Informational, factor into models.
    Background,
}

impl SignalUrgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalUrgency::Immediate => "immediate",
            SignalUrgency::Watch => "watch",
            SignalUrgency::Background => "background",
        }
    }
}

/// Default signal time-to-live.
pub const DEFAULT_SIGNAL_TTL_SECONDS: i64 = 300;

/// Individual signal emitted by a signal processor.
///
/// A signal is *live* iff `now - ts <= ttl_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub signal_type: String,
    pub market_ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_ticker: Option<String>,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub urgency: SignalUrgency,
    #[serde(default)]
    pub metadata: Value,
    pub ts: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl Signal {
    /// Build a signal stamped now with a fresh id and the default TTL.
    ///
    /// Strength and confidence are clamped into `[0, 1]`.
    pub fn new(
        signal_type: impl Into<String>,
        market_ticker: impl Into<String>,
        direction: SignalDirection,
        strength: f64,
        confidence: f64,
        urgency: SignalUrgency,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            signal_type: signal_type.into(),
            market_ticker: market_ticker.into(),
            event_ticker: None,
            series_ticker: None,
            direction,
            strength: strength.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            urgency,
            metadata: Value::Object(Default::default()),
            ts: Utc::now(),
            ttl_seconds: DEFAULT_SIGNAL_TTL_SECONDS,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_event_ticker(mut self, event_ticker: Option<String>) -> Self {
        self.event_ticker = event_ticker;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        (now - self.ts).num_seconds() > self.ttl_seconds
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(Error::Parse(format!(
                "signal {}: strength {} out of range",
                self.signal_id, self.strength
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Parse(format!(
                "signal {}: confidence {} out of range",
                self.signal_id, self.confidence
            )));
        }
        Ok(())
    }
}

/// Output of the aggregator: one composite per market when actionable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub market_ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_ticker: Option<String>,
    pub direction: SignalDirection,
    pub composite_score: f64,
    pub active_signals: Vec<Signal>,
    pub regime: MarketRegime,
    pub ts: DateTime<Utc>,
}

/// Per-market regime summary stored at `state:regime:{ticker}` (120 s TTL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: MarketRegime,
    pub depth_imbalance: f64,
    pub trade_rate: f64,
    pub message_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<i64>,
    pub yes_depth: i64,
    pub no_depth: i64,
    pub ts: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_signal_creation() {
        let signal = Signal::new(
            "flow_toxicity",
            "TEST-MKT",
            SignalDirection::BuyYes,
            0.8,
            0.7,
            SignalUrgency::Watch,
        );
        assert!(!signal.signal_id.is_empty());
        assert_eq!(signal.strength, 0.8);
        assert_eq!(signal.ttl_seconds, DEFAULT_SIGNAL_TTL_SECONDS);
        assert!(!signal.is_expired());
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn test_signal_ids_unique() {
        let a = Signal::new("t", "M", SignalDirection::Neutral, 0.5, 0.5, SignalUrgency::Watch);
        let b = Signal::new("t", "M", SignalDirection::Neutral, 0.5, 0.5, SignalUrgency::Watch);
        assert_ne!(a.signal_id, b.signal_id);
    }

    #[test]
    fn test_signal_clamps_strength_and_confidence() {
        let signal = Signal::new(
            "test",
            "M",
            SignalDirection::BuyNo,
            1.7,
            -0.2,
            SignalUrgency::Immediate,
        );
        assert_eq!(signal.strength, 1.0);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_signal_expiration() {
        let mut signal = Signal::new(
            "test",
            "M",
            SignalDirection::Neutral,
            0.5,
            0.5,
            SignalUrgency::Background,
        );
        signal.ts = Utc::now() - Duration::seconds(400);
        signal.ttl_seconds = 300;
        assert!(signal.is_expired());

        signal.ttl_seconds = 500;
        assert!(!signal.is_expired());
    }

    #[test]
    fn test_signal_round_trip() {
        let signal = Signal::new(
            "oi_divergence",
            "TEST-MKT",
            SignalDirection::BuyNo,
            0.9,
            0.75,
            SignalUrgency::Watch,
        )
        .with_metadata(serde_json::json!({"regime": "new_shorts", "zscore": 2.8}))
        .with_event_ticker(Some("TEST".to_string()));

        let encoded = serde_json::to_string(&signal).unwrap();
        let restored: Signal = serde_json::from_str(&encoded).unwrap();
        assert_eq!(signal, restored);
    }

    #[test]
    fn test_direction_wire_format() {
        assert_eq!(
            serde_json::to_string(&SignalDirection::BuyYes).unwrap(),
            "\"buy_yes\""
        );
        assert_eq!(
            serde_json::to_string(&SignalUrgency::Immediate).unwrap(),
            "\"immediate\""
        );
        assert_eq!(
            serde_json::to_string(&MarketRegime::PreSettlement).unwrap(),
            "\"pre_settle\""
        );
    }

    #[test]
    fn test_direction_multiplier() {
        assert_eq!(SignalDirection::BuyYes.multiplier(), 1.0);
        assert_eq!(SignalDirection::BuyNo.multiplier(), -1.0);
        assert_eq!(SignalDirection::Neutral.multiplier(), 0.0);
    }

    #[test]
    fn test_regime_snapshot_round_trip() {
        let snap = RegimeSnapshot {
            regime: MarketRegime::Informed,
            depth_imbalance: 0.72,
            trade_rate: 6.5,
            message_rate: 1.2,
            last_price: Some(42),
            yes_depth: 1200,
            no_depth: 190,
            ts: 1700000000.0,
        };
        let encoded = serde_json::to_string(&snap).unwrap();
        let restored: RegimeSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(snap, restored);
    }
}
