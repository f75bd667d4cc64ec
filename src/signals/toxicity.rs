//! Flow toxicity classifier: VPIN-based informed-flow detection.
//!
//! Consumes `kalshi:trades`, maintains per-market volume buckets, and emits
//! `flow_toxicity`, `flow_burst`, and `flow_large_trade` signals.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;

use super::config::FlowToxicityConfig;
use super::processor::Processor;
use crate::bus::topics;
use crate::error::Result;
use crate::models::{KalshiTrade, Side, Signal, SignalDirection, SignalUrgency};

const TIMESTAMP_WINDOW: usize = 100;
const SIZE_WINDOW: usize = 200;

/// Per-market rolling flow state.
#[derive(Debug)]
pub(crate) struct MarketFlowState {
    bucket_size: i64,
    window_size: usize,

    current_bucket_volume: i64,
    current_bucket_buy_volume: i64,

    bucket_vpins: VecDeque<f64>,
    trade_timestamps: VecDeque<i64>,
    trade_sizes: VecDeque<i64>,

    total_volume: i64,
    total_trades: u64,
}

impl MarketFlowState {
    pub(crate) fn new(bucket_size: i64, window_size: usize) -> Self {
        Self {
            bucket_size,
            window_size,
            current_bucket_volume: 0,
            current_bucket_buy_volume: 0,
            bucket_vpins: VecDeque::with_capacity(window_size),
            trade_timestamps: VecDeque::with_capacity(TIMESTAMP_WINDOW),
            trade_sizes: VecDeque::with_capacity(SIZE_WINDOW),
            total_volume: 0,
            total_trades: 0,
        }
    }

    pub(crate) fn add_trade(&mut self, trade: &KalshiTrade) {
        self.current_bucket_volume += trade.count;
        if trade.taker_side == Side::Yes {
            self.current_bucket_buy_volume += trade.count;
        }

        if self.trade_timestamps.len() == TIMESTAMP_WINDOW {
            self.trade_timestamps.pop_front();
        }
        self.trade_timestamps.push_back(trade.ts);

        if self.trade_sizes.len() == SIZE_WINDOW {
            self.trade_sizes.pop_front();
        }
        self.trade_sizes.push_back(trade.count);

        self.total_volume += trade.count;
        self.total_trades += 1;
    }

    pub(crate) fn current_bucket_full(&self) -> bool {
        self.current_bucket_volume >= self.bucket_size
    }

    /// VPIN for the current bucket: `|buy_ratio - 0.5| * 2`, in `[0, 1]`.
    /// 0 = perfectly balanced, 1 = completely one-sided.
    pub(crate) fn compute_vpin(&self) -> f64 {
        if self.current_bucket_volume == 0 {
            return 0.0;
        }
        let buy_ratio = self.current_bucket_buy_volume as f64 / self.current_bucket_volume as f64;
        (buy_ratio - 0.5).abs() * 2.0
    }

    /// Close the current bucket, appending its VPIN to the rolling window.
    pub(crate) fn advance_bucket(&mut self) {
        if self.bucket_vpins.len() == self.window_size {
            self.bucket_vpins.pop_front();
        }
        self.bucket_vpins.push_back(self.compute_vpin());
        self.current_bucket_volume = 0;
        self.current_bucket_buy_volume = 0;
    }

    pub(crate) fn rolling_vpin(&self) -> f64 {
        if self.bucket_vpins.is_empty() {
            return 0.0;
        }
        self.bucket_vpins.iter().sum::<f64>() / self.bucket_vpins.len() as f64
    }

    pub(crate) fn mean_trade_size(&self) -> f64 {
        if self.trade_sizes.is_empty() {
            return 0.0;
        }
        self.trade_sizes.iter().sum::<i64>() as f64 / self.trade_sizes.len() as f64
    }

    /// True when at least `min_trades` arrived within `window_seconds` of the
    /// most recent trade.
    pub(crate) fn detect_burst(&self, window_seconds: f64, min_trades: usize) -> bool {
        if self.trade_timestamps.len() < min_trades {
            return false;
        }
        let now = *self.trade_timestamps.back().expect("non-empty");
        let recent = self
            .trade_timestamps
            .iter()
            .filter(|&&t| (now - t) as f64 <= window_seconds)
            .count();
        recent >= min_trades
    }

    /// Which side the current bucket's flow favours. Requires 60%+ imbalance.
    pub(crate) fn dominant_direction(&self) -> SignalDirection {
        if self.current_bucket_volume == 0 {
            return SignalDirection::Neutral;
        }
        let buy_ratio = self.current_bucket_buy_volume as f64 / self.current_bucket_volume as f64;
        if buy_ratio > 0.6 {
            SignalDirection::BuyYes
        } else if buy_ratio < 0.4 {
            SignalDirection::BuyNo
        } else {
            SignalDirection::Neutral
        }
    }

    /// Trades per second over the tracked timestamps.
    pub(crate) fn inter_arrival_rate(&self) -> f64 {
        if self.trade_timestamps.len() < 2 {
            return 0.0;
        }
        let first = *self.trade_timestamps.front().expect("non-empty");
        let last = *self.trade_timestamps.back().expect("non-empty");
        let span = (last - first) as f64;
        if span <= 0.0 {
            return 0.0;
        }
        self.trade_timestamps.len() as f64 / span
    }

    fn side_str(direction: SignalDirection) -> &'static str {
        match direction {
            SignalDirection::BuyYes => "yes",
            SignalDirection::BuyNo => "no",
            SignalDirection::Neutral => "neutral",
        }
    }
}

/// Detects informed flow using volume-synchronized trade analysis.
pub struct FlowToxicityClassifier {
    config: FlowToxicityConfig,
    market_state: HashMap<String, MarketFlowState>,
}

impl FlowToxicityClassifier {
    pub fn new(config: FlowToxicityConfig) -> Self {
        Self {
            config,
            market_state: HashMap::new(),
        }
    }

    fn state_for(&mut self, ticker: &str) -> &mut MarketFlowState {
        let (bucket_size, window_size) = (self.config.bucket_size, self.config.window_size);
        self.market_state
            .entry(ticker.to_string())
            .or_insert_with(|| MarketFlowState::new(bucket_size, window_size))
    }

    pub(crate) fn on_trade(&mut self, trade: &KalshiTrade) -> Vec<Signal> {
        let config = self.config.clone();
        let state = self.state_for(&trade.market_ticker);

        // Markets with material trade history but almost no volume carry no
        // informational edge.
        if state.total_volume < config.min_market_volume && state.total_trades > 10 {
            return Vec::new();
        }

        state.add_trade(trade);
        let mut signals = Vec::new();

        if state.current_bucket_full() {
            let vpin = state.compute_vpin();
            let direction = state.dominant_direction();
            state.advance_bucket();

            if vpin > config.vpin_threshold {
                let filled = state.bucket_vpins.len() as f64 / state.window_size as f64;
                let urgency = if vpin > 0.85 {
                    SignalUrgency::Immediate
                } else {
                    SignalUrgency::Watch
                };
                signals.push(
                    Signal::new(
                        "flow_toxicity",
                        &trade.market_ticker,
                        direction,
                        vpin.min(1.0),
                        (0.5 + filled * 0.3).min(1.0),
                        urgency,
                    )
                    .with_metadata(serde_json::json!({
                        "vpin": vpin,
                        "rolling_vpin": state.rolling_vpin(),
                        "bucket_count": state.bucket_vpins.len(),
                        "dominant_side": MarketFlowState::side_str(direction),
                        "total_volume": state.total_volume,
                    })),
                );
            }

            if state.rolling_vpin() > config.rolling_vpin_threshold && state.bucket_vpins.len() >= 5
            {
                signals.push(
                    Signal::new(
                        "flow_toxicity",
                        &trade.market_ticker,
                        direction,
                        state.rolling_vpin().min(1.0),
                        0.7,
                        SignalUrgency::Watch,
                    )
                    .with_metadata(serde_json::json!({
                        "rolling_vpin": state.rolling_vpin(),
                        "bucket_count": state.bucket_vpins.len(),
                        "dominant_side": MarketFlowState::side_str(direction),
                        "pattern": "sustained_toxicity",
                    })),
                );
            }
        }

        if state.detect_burst(config.burst_window_seconds, config.burst_min_trades) {
            let rate = state.inter_arrival_rate();
            let direction = state.dominant_direction();
            signals.push(
                Signal::new(
                    "flow_burst",
                    &trade.market_ticker,
                    direction,
                    (rate / 10.0).min(1.0),
                    (0.3 + rate / 20.0).min(0.8),
                    SignalUrgency::Immediate,
                )
                .with_metadata(serde_json::json!({
                    "inter_arrival_rate": rate,
                    "dominant_side": MarketFlowState::side_str(direction),
                    "trade_burst": true,
                })),
            );
        }

        let mean_size = state.mean_trade_size();
        if mean_size > 0.0 && (trade.count as f64) > mean_size * config.size_multiplier {
            let size_ratio = trade.count as f64 / mean_size;
            let direction = match trade.taker_side {
                Side::Yes => SignalDirection::BuyYes,
                Side::No => SignalDirection::BuyNo,
            };
            signals.push(
                Signal::new(
                    "flow_large_trade",
                    &trade.market_ticker,
                    direction,
                    (trade.count as f64 / (mean_size * config.size_multiplier * 2.0)).min(1.0),
                    (0.4 + size_ratio / (config.size_multiplier * 4.0)).min(0.85),
                    SignalUrgency::Watch,
                )
                .with_metadata(serde_json::json!({
                    "trade_size": trade.count,
                    "mean_trade_size": mean_size,
                    "size_ratio": size_ratio,
                    "taker_side": trade.taker_side.as_str(),
                })),
            );
        }

        signals
    }
}

#[async_trait]
impl Processor for FlowToxicityClassifier {
    fn name(&self) -> &'static str {
        "flow_toxicity"
    }

    fn input_topics(&self) -> &'static [&'static str] {
        &[topics::TRADES]
    }

    fn output_topic(&self) -> &'static str {
        topics::SIGNALS_FLOW_TOXICITY
    }

    async fn process(&mut self, _topic: &'static str, payload: &str) -> Result<Vec<Signal>> {
        let trade: KalshiTrade = serde_json::from_str(payload)?;
        Ok(self.on_trade(&trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: usize, side: Side, count: i64, ts: i64) -> KalshiTrade {
        KalshiTrade {
            trade_id: format!("t{id}"),
            market_ticker: "TEST".to_string(),
            yes_price: 50,
            no_price: 50,
            count,
            taker_side: side,
            ts,
            yes_price_dollars: None,
            no_price_dollars: None,
            count_fp: None,
        }
    }

    #[test]
    fn test_one_sided_bucket_emits_toxicity() {
        // 50 all-yes unit trades, bucket size 25: the 25th trade fills the
        // bucket with VPIN 1.0 and emits an immediate buy_yes signal. The
        // liquidity floor is lifted so unit-count flow reaches the bucket.
        let mut classifier = FlowToxicityClassifier::new(FlowToxicityConfig {
            min_market_volume: 0,
            ..Default::default()
        });

        let mut toxicity_signals = Vec::new();
        for i in 0..50 {
            // Spread timestamps out to keep burst detection quiet.
            let signals = classifier.on_trade(&trade(i, Side::Yes, 1, 1_700_000_000 + i as i64 * 60));
            toxicity_signals.extend(
                signals
                    .into_iter()
                    .filter(|s| s.signal_type == "flow_toxicity"),
            );
        }

        assert_eq!(toxicity_signals.len(), 2); // one per completed bucket
        let first = &toxicity_signals[0];
        assert_eq!(first.strength, 1.0);
        assert_eq!(first.direction, SignalDirection::BuyYes);
        assert_eq!(first.urgency, SignalUrgency::Immediate);
    }

    #[test]
    fn test_balanced_flow_has_low_vpin() {
        let mut state = MarketFlowState::new(50, 20);
        for i in 0..100 {
            let side = if i % 2 == 0 { Side::Yes } else { Side::No };
            state.add_trade(&trade(i, side, 1, 1_700_000_000 + i as i64));
            if state.current_bucket_full() {
                assert!(state.compute_vpin() < 0.1);
                state.advance_bucket();
            }
        }
    }

    #[test]
    fn test_vpin_extremes() {
        let mut state = MarketFlowState::new(25, 20);
        for i in 0..25 {
            state.add_trade(&trade(i, Side::No, 1, 1_700_000_000 + i as i64));
        }
        assert_eq!(state.compute_vpin(), 1.0);
        assert_eq!(state.dominant_direction(), SignalDirection::BuyNo);
    }

    #[test]
    fn test_burst_detection() {
        let mut state = MarketFlowState::new(25, 20);
        for i in 0..8 {
            state.add_trade(&trade(i, Side::Yes, 1, 1_700_000_000)); // same second
        }
        assert!(state.detect_burst(5.0, 8));

        let mut slow = MarketFlowState::new(25, 20);
        for i in 0..8 {
            slow.add_trade(&trade(i, Side::Yes, 1, 1_700_000_000 + i as i64 * 10));
        }
        assert!(!slow.detect_burst(5.0, 8));
    }

    #[test]
    fn test_large_trade_signal() {
        let mut classifier = FlowToxicityClassifier::new(FlowToxicityConfig::default());
        // Seed a baseline of unit trades.
        for i in 0..10 {
            classifier.on_trade(&trade(i, Side::Yes, 1, 1_700_000_000 + i as i64 * 100));
        }
        // A 10x trade exceeds 3x the running mean.
        let signals = classifier.on_trade(&trade(99, Side::No, 10, 1_700_010_000));
        let large: Vec<_> = signals
            .iter()
            .filter(|s| s.signal_type == "flow_large_trade")
            .collect();
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].direction, SignalDirection::BuyNo);
    }

    #[test]
    fn test_illiquid_market_is_skipped() {
        let mut classifier = FlowToxicityClassifier::new(FlowToxicityConfig::default());
        // 11 unit trades: volume 11 < 200 with more than 10 trades recorded,
        // so subsequent trades produce nothing.
        for i in 0..11 {
            classifier.on_trade(&trade(i, Side::Yes, 1, 1_700_000_000 + i as i64 * 60));
        }
        let signals = classifier.on_trade(&trade(12, Side::Yes, 1, 1_700_001_000));
        assert!(signals.is_empty());
    }

    #[test]
    fn test_sustained_toxicity_needs_five_buckets() {
        let mut classifier = FlowToxicityClassifier::new(FlowToxicityConfig {
            min_market_volume: 0,
            ..Default::default()
        });

        let mut sustained = 0;
        for i in 0..200 {
            let signals = classifier.on_trade(&trade(i, Side::Yes, 1, 1_700_000_000 + i as i64 * 60));
            sustained += signals
                .iter()
                .filter(|s| {
                    s.metadata.get("pattern").and_then(|p| p.as_str()) == Some("sustained_toxicity")
                })
                .count();
        }
        // 200 unit trades = 8 buckets; the pattern needs at least 5 recorded
        // buckets, so exactly buckets 5..=8 qualify.
        assert_eq!(sustained, 4);
    }
}
