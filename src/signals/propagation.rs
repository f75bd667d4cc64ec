//! Cross-market propagation engine.
//!
//! When one market in an event reprices or fires a strong flow/OI signal,
//! related markets that have not moved are candidates for repricing. The
//! expected direction is inferred from the threshold ordering parsed out of
//! each market's subtitle; when either threshold is unparseable, the types
//! differ, or the thresholds are equal, no signal is emitted. Same-event
//! brackets are not reliably positively correlated, so the ambiguous cases
//! stay silent rather than risk anti-predictive output.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::debug;

use super::config::CrossMarketConfig;
use super::processor::Processor;
use crate::bus::{SignalReader, topics};
use crate::discovery::SeriesMapper;
use crate::error::Result;
use crate::models::{KalshiTickerV2, Signal, SignalDirection, SignalUrgency};

/// A bracket threshold parsed from a market's subtitle or title.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Threshold {
    Above(f64),
    Below(f64),
    Between(f64, f64),
}

fn between_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bbetween\s+\$?([\d,]+(?:\.\d+)?)\s+and\s+\$?([\d,]+(?:\.\d+)?)")
            .expect("valid regex")
    })
}

fn above_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:above|over|more than|at least|exceeds?)\s+\$?([\d,]+(?:\.\d+)?)")
            .expect("valid regex")
    })
}

fn below_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:below|under|less than|at most)\s+\$?([\d,]+(?:\.\d+)?)")
            .expect("valid regex")
    })
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

/// Extract a threshold from free-form market text.
pub(crate) fn parse_threshold(text: &str) -> Option<Threshold> {
    if let Some(caps) = between_re().captures(text) {
        let low = parse_number(&caps[1])?;
        let high = parse_number(&caps[2])?;
        return Some(Threshold::Between(low, high));
    }
    if let Some(caps) = above_re().captures(text) {
        return Some(Threshold::Above(parse_number(&caps[1])?));
    }
    if let Some(caps) = below_re().captures(text) {
        return Some(Threshold::Below(parse_number(&caps[1])?));
    }
    None
}

/// Direction the target should move given the source's move direction.
///
/// Only same-type `above`/`below` thresholds with distinct values order the
/// brackets; everything else suppresses the signal.
pub(crate) fn expected_direction(
    source: Option<Threshold>,
    target: Option<Threshold>,
    source_moved_up: bool,
) -> Option<SignalDirection> {
    let ordered = match (source?, target?) {
        (Threshold::Above(s), Threshold::Above(t)) => s != t,
        (Threshold::Below(s), Threshold::Below(t)) => s != t,
        _ => false,
    };
    if !ordered {
        return None;
    }

    Some(if source_moved_up {
        SignalDirection::BuyYes
    } else {
        SignalDirection::BuyNo
    })
}

/// A qualifying price move on a source market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PriceMove {
    pub old_price: i64,
    pub new_price: i64,
}

/// Last known price and last qualifying move time per market.
#[derive(Debug, Default)]
pub(crate) struct PriceTracker {
    prices: HashMap<String, i64>,
    move_timestamps: HashMap<String, f64>,
}

impl PriceTracker {
    /// Record a price observation; returns the move when it clears
    /// `min_move` and stamps the move time.
    pub(crate) fn record(
        &mut self,
        ticker: &str,
        price: i64,
        min_move: i64,
        now: f64,
    ) -> Option<PriceMove> {
        let old = self.prices.insert(ticker.to_string(), price)?;
        if (price - old).abs() < min_move {
            return None;
        }
        self.move_timestamps.insert(ticker.to_string(), now);
        Some(PriceMove {
            old_price: old,
            new_price: price,
        })
    }

    pub(crate) fn price(&self, ticker: &str) -> Option<i64> {
        self.prices.get(ticker).copied()
    }

    /// Seconds since the market last moved, or infinity when it never has.
    pub(crate) fn seconds_since_move(&self, ticker: &str, now: f64) -> f64 {
        match self.move_timestamps.get(ticker) {
            Some(&last) => now - last,
            None => f64::INFINITY,
        }
    }
}

/// Detects un-propagated repricings across markets in the same event.
pub struct CrossMarketEngine {
    config: CrossMarketConfig,
    mapper: SeriesMapper,
    reader: SignalReader,
    tracker: PriceTracker,
    threshold_cache: HashMap<String, Option<Threshold>>,
    event_cache: HashMap<String, Option<String>>,
}

impl CrossMarketEngine {
    pub fn new(config: CrossMarketConfig, mapper: SeriesMapper, reader: SignalReader) -> Self {
        Self {
            config,
            mapper,
            reader,
            tracker: PriceTracker::default(),
            threshold_cache: HashMap::new(),
            event_cache: HashMap::new(),
        }
    }

    async fn threshold_for(&mut self, ticker: &str) -> Option<Threshold> {
        if let Some(cached) = self.threshold_cache.get(ticker) {
            return *cached;
        }
        let parsed = match self.mapper.market_text(ticker).await {
            Ok(Some((title, subtitle))) => subtitle
                .as_deref()
                .and_then(parse_threshold)
                .or_else(|| parse_threshold(&title)),
            _ => None,
        };
        self.threshold_cache.insert(ticker.to_string(), parsed);
        parsed
    }

    async fn event_ticker_for(&mut self, ticker: &str) -> Option<String> {
        if let Some(cached) = self.event_cache.get(ticker) {
            return cached.clone();
        }
        let event = self.mapper.event_ticker_for(ticker).await.ok().flatten();
        self.event_cache.insert(ticker.to_string(), event.clone());
        event
    }

    /// A market repriced: flag related markets that have not followed.
    async fn check_propagation(
        &mut self,
        moved_ticker: &str,
        price_move: PriceMove,
        now: f64,
    ) -> Vec<Signal> {
        let related = match self.mapper.get_related_markets(moved_ticker).await {
            Ok(related) => related,
            Err(e) => {
                debug!(ticker = moved_ticker, error = %e, "related_lookup_failed");
                return Vec::new();
            }
        };
        if related.is_empty() || related.len() > self.config.max_related_markets {
            return Vec::new();
        }

        let moved_up = price_move.new_price > price_move.old_price;
        let magnitude = (price_move.new_price - price_move.old_price).abs();
        let source_threshold = self.threshold_for(moved_ticker).await;

        let mut signals = Vec::new();
        for related_ticker in related {
            if related_ticker == moved_ticker {
                continue;
            }
            let Some(related_price) = self.tracker.price(&related_ticker) else {
                continue;
            };

            let lag = self.tracker.seconds_since_move(&related_ticker, now);
            if lag <= self.config.propagation_window_seconds {
                continue; // Already repriced.
            }

            let target_threshold = self.threshold_for(&related_ticker).await;
            let Some(direction) = expected_direction(source_threshold, target_threshold, moved_up)
            else {
                continue;
            };

            let event_ticker = self.event_ticker_for(&related_ticker).await;
            signals.push(
                Signal::new(
                    "cross_market_propagation",
                    &related_ticker,
                    direction,
                    (magnitude as f64 / 10.0).min(1.0),
                    0.65,
                    SignalUrgency::Immediate,
                )
                .with_event_ticker(event_ticker)
                .with_metadata(serde_json::json!({
                    "source_market": moved_ticker,
                    "source_old_price": price_move.old_price,
                    "source_new_price": price_move.new_price,
                    "target_current_price": related_price,
                    "propagation_lag_seconds": if lag.is_finite() { Some(lag) } else { None },
                    "move_magnitude": magnitude,
                })),
            );
        }

        signals
    }

    /// A strong flow/OI signal fired: propagate it to related markets that
    /// show neither a live flow/OI signal nor a recent repricing.
    async fn check_signal_propagation(&mut self, source: &Signal, now: f64) -> Vec<Signal> {
        let related = match self.mapper.get_related_markets(&source.market_ticker).await {
            Ok(related) => related,
            Err(e) => {
                debug!(ticker = %source.market_ticker, error = %e, "related_lookup_failed");
                return Vec::new();
            }
        };

        let mut signals = Vec::new();
        for related_ticker in related {
            if related_ticker == source.market_ticker {
                continue;
            }

            let existing = self
                .reader
                .active_signals_for_market(&related_ticker)
                .await
                .unwrap_or_default();
            if existing
                .iter()
                .any(|s| matches!(s.signal_type.as_str(), "flow_toxicity" | "oi_divergence"))
            {
                continue; // Already signalled on its own.
            }

            if self.tracker.seconds_since_move(&related_ticker, now)
                <= self.config.propagation_window_seconds
            {
                continue; // Already repriced.
            }

            signals.push(
                Signal::new(
                    "signal_propagation",
                    &related_ticker,
                    source.direction,
                    source.strength * self.config.signal_attenuation,
                    source.confidence * self.config.confidence_attenuation,
                    SignalUrgency::Watch,
                )
                .with_event_ticker(source.event_ticker.clone())
                .with_metadata(serde_json::json!({
                    "source_signal_id": source.signal_id,
                    "source_signal_type": source.signal_type,
                    "source_market": source.market_ticker,
                    "attenuation": self.config.signal_attenuation,
                })),
            );
        }

        signals
    }
}

#[async_trait]
impl Processor for CrossMarketEngine {
    fn name(&self) -> &'static str {
        "cross_market"
    }

    fn input_topics(&self) -> &'static [&'static str] {
        &[
            topics::SIGNALS_FLOW_TOXICITY,
            topics::SIGNALS_OI_DIVERGENCE,
            topics::TICKER_V2,
        ]
    }

    fn output_topic(&self) -> &'static str {
        topics::SIGNALS_CROSS_MARKET
    }

    async fn process(&mut self, topic: &'static str, payload: &str) -> Result<Vec<Signal>> {
        let now = Utc::now().timestamp() as f64;

        match topic {
            topics::TICKER_V2 => {
                let ticker: KalshiTickerV2 = serde_json::from_str(payload)?;
                let Some(price) = ticker.price else {
                    return Ok(Vec::new());
                };
                let min_move = self.config.min_price_move;
                match self.tracker.record(&ticker.market_ticker, price, min_move, now) {
                    Some(price_move) => Ok(self
                        .check_propagation(&ticker.market_ticker, price_move, now)
                        .await),
                    None => Ok(Vec::new()),
                }
            }

            topics::SIGNALS_FLOW_TOXICITY | topics::SIGNALS_OI_DIVERGENCE => {
                let source: Signal = serde_json::from_str(payload)?;
                if source.direction == SignalDirection::Neutral
                    || source.strength < self.config.min_source_strength
                {
                    return Ok(Vec::new());
                }
                Ok(self.check_signal_propagation(&source, now).await)
            }

            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threshold_above() {
        assert_eq!(parse_threshold("Above $100,000"), Some(Threshold::Above(100_000.0)));
        assert_eq!(parse_threshold("over 3.5"), Some(Threshold::Above(3.5)));
        assert_eq!(parse_threshold("At least 250"), Some(Threshold::Above(250.0)));
    }

    #[test]
    fn test_parse_threshold_below() {
        assert_eq!(parse_threshold("Below $95,000"), Some(Threshold::Below(95_000.0)));
        assert_eq!(parse_threshold("under 2"), Some(Threshold::Below(2.0)));
    }

    #[test]
    fn test_parse_threshold_between() {
        assert_eq!(
            parse_threshold("Between 3.0 and 3.5"),
            Some(Threshold::Between(3.0, 3.5))
        );
        assert_eq!(
            parse_threshold("between $90,000 and $100,000"),
            Some(Threshold::Between(90_000.0, 100_000.0))
        );
    }

    #[test]
    fn test_parse_threshold_unparseable() {
        assert_eq!(parse_threshold("Who wins the election?"), None);
        assert_eq!(parse_threshold(""), None);
    }

    #[test]
    fn test_expected_direction_same_type_ordered() {
        let source = Some(Threshold::Above(100_000.0));
        let target = Some(Threshold::Above(110_000.0));
        assert_eq!(
            expected_direction(source, target, true),
            Some(SignalDirection::BuyYes)
        );
        assert_eq!(
            expected_direction(source, target, false),
            Some(SignalDirection::BuyNo)
        );

        let source = Some(Threshold::Below(2.0));
        let target = Some(Threshold::Below(3.0));
        assert_eq!(
            expected_direction(source, target, true),
            Some(SignalDirection::BuyYes)
        );
    }

    #[test]
    fn test_price_tracker_records_qualifying_moves() {
        let mut tracker = PriceTracker::default();

        // First observation just seeds the price.
        assert_eq!(tracker.record("M1", 40, 3, 100.0), None);
        // A 2c move is below the minimum.
        assert_eq!(tracker.record("M1", 42, 3, 110.0), None);
        assert_eq!(tracker.seconds_since_move("M1", 110.0), f64::INFINITY);

        // A 4c move qualifies and stamps the move time.
        assert_eq!(
            tracker.record("M1", 46, 3, 120.0),
            Some(PriceMove {
                old_price: 42,
                new_price: 46
            })
        );
        assert_eq!(tracker.seconds_since_move("M1", 150.0), 30.0);
        assert_eq!(tracker.price("M1"), Some(46));
    }

    #[test]
    fn test_expected_direction_suppressed_cases() {
        // Differing threshold types.
        assert_eq!(
            expected_direction(
                Some(Threshold::Above(100.0)),
                Some(Threshold::Below(90.0)),
                true
            ),
            None
        );
        // Between brackets are not ordered.
        assert_eq!(
            expected_direction(
                Some(Threshold::Between(1.0, 2.0)),
                Some(Threshold::Between(2.0, 3.0)),
                true
            ),
            None
        );
        // Equal thresholds.
        assert_eq!(
            expected_direction(
                Some(Threshold::Above(100.0)),
                Some(Threshold::Above(100.0)),
                true
            ),
            None
        );
        // Unparseable on either side.
        assert_eq!(
            expected_direction(None, Some(Threshold::Above(100.0)), true),
            None
        );
        assert_eq!(
            expected_direction(Some(Threshold::Above(100.0)), None, false),
            None
        );
    }
}
