//! Open-interest divergence detector.
//!
//! Consumes `kalshi:ticker_v2` and flags markets where open interest moves
//! against (or with) price in a statistically unusual way, signalling hidden
//! positioning building beneath the surface.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;

use super::config::OiDivergenceConfig;
use super::processor::Processor;
use crate::bus::topics;
use crate::error::Result;
use crate::models::{KalshiTickerV2, Signal, SignalDirection, SignalUrgency};

const VELOCITY_HISTORY: usize = 200;
const VELOCITY_SPAN: usize = 10;

/// The four classic OI/price regimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OiRegime {
    NewLongs,
    NewShorts,
    ShortCovering,
    LongLiquidation,
}

impl OiRegime {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OiRegime::NewLongs => "new_longs",
            OiRegime::NewShorts => "new_shorts",
            OiRegime::ShortCovering => "short_covering",
            OiRegime::LongLiquidation => "long_liquidation",
        }
    }

    pub(crate) fn direction(&self) -> SignalDirection {
        match self {
            OiRegime::NewLongs | OiRegime::ShortCovering => SignalDirection::BuyYes,
            OiRegime::NewShorts | OiRegime::LongLiquidation => SignalDirection::BuyNo,
        }
    }

    /// Fresh positioning carries more conviction than unwinds.
    pub(crate) fn confidence(&self) -> f64 {
        match self {
            OiRegime::NewLongs | OiRegime::NewShorts => 0.75,
            OiRegime::ShortCovering | OiRegime::LongLiquidation => 0.45,
        }
    }
}

/// Per-market rolling OI state.
#[derive(Debug)]
pub(crate) struct OiMarketState {
    window_size: usize,
    prices: VecDeque<i64>,
    oi_deltas: VecDeque<f64>,
    dollar_oi_deltas: VecDeque<i64>,
    cumulative_oi_delta: f64,
    observation_count: u64,
    velocity_history: VecDeque<f64>,
}

impl OiMarketState {
    pub(crate) fn new(window_size: usize) -> Self {
        Self {
            window_size,
            prices: VecDeque::with_capacity(window_size),
            oi_deltas: VecDeque::with_capacity(window_size),
            dollar_oi_deltas: VecDeque::with_capacity(window_size),
            cumulative_oi_delta: 0.0,
            observation_count: 0,
            velocity_history: VecDeque::with_capacity(VELOCITY_HISTORY),
        }
    }

    pub(crate) fn update(&mut self, ticker: &KalshiTickerV2) {
        if let Some(price) = ticker.price {
            push_bounded(&mut self.prices, price, self.window_size);
        }
        if let Some(oi_delta) = ticker.open_interest_delta {
            push_bounded(&mut self.oi_deltas, oi_delta as f64, self.window_size);
            self.cumulative_oi_delta += oi_delta as f64;
        }
        if let Some(dollar) = ticker.dollar_open_interest_delta {
            push_bounded(&mut self.dollar_oi_deltas, dollar, self.window_size);
        }
        self.observation_count += 1;
    }

    pub(crate) fn last_price(&self) -> Option<i64> {
        self.prices.back().copied()
    }

    pub(crate) fn observation_count(&self) -> u64 {
        self.observation_count
    }

    /// Classify the OI/price regime: recent OI direction (sign of the last 10
    /// deltas) against price direction (later-half mean vs earlier-half mean).
    pub(crate) fn classify_regime(&self) -> Option<OiRegime> {
        if self.prices.len() < 5 || self.oi_deltas.len() < 5 {
            return None;
        }

        let prices: Vec<i64> = self.prices.iter().copied().collect();
        let mid = prices.len() / 2;
        let earlier = mean_i64(&prices[..mid]);
        let recent = mean_i64(&prices[mid..]);
        let price_rising = recent > earlier;

        let oi_net: f64 = self.oi_deltas.iter().rev().take(VELOCITY_SPAN).sum();
        let oi_rising = oi_net > 0.0;

        Some(match (oi_rising, price_rising) {
            (true, true) => OiRegime::NewLongs,
            (true, false) => OiRegime::NewShorts,
            (false, true) => OiRegime::ShortCovering,
            (false, false) => OiRegime::LongLiquidation,
        })
    }

    /// Mean OI delta per observation over the recent window.
    pub(crate) fn oi_velocity(&self) -> f64 {
        if self.oi_deltas.len() < 2 {
            return 0.0;
        }
        let recent: Vec<f64> = self.oi_deltas.iter().rev().take(VELOCITY_SPAN).copied().collect();
        recent.iter().sum::<f64>() / recent.len() as f64
    }

    /// How unusual the current |velocity| is against this market's history.
    ///
    /// Each call records the current observation into the history window.
    pub(crate) fn oi_velocity_zscore(&mut self) -> f64 {
        let current = self.oi_velocity().abs();
        push_bounded(&mut self.velocity_history, current, VELOCITY_HISTORY);

        if self.velocity_history.len() <= 10 {
            return 0.0;
        }

        let n = self.velocity_history.len() as f64;
        let mean = self.velocity_history.iter().sum::<f64>() / n;
        let variance = self
            .velocity_history
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = variance.sqrt();

        if std < 0.001 {
            return 0.0;
        }
        (current - mean) / std
    }

    /// True when the dollar-denominated OI change agrees in sign with the
    /// contract-count OI change over the recent window.
    pub(crate) fn dollar_oi_confirms(&self) -> bool {
        if self.dollar_oi_deltas.is_empty() || self.oi_deltas.is_empty() {
            return false;
        }
        let recent_oi: f64 = self.oi_deltas.iter().rev().take(5).sum();
        let recent_dollar: i64 = self.dollar_oi_deltas.iter().rev().take(5).sum();
        (recent_oi > 0.0 && recent_dollar > 0) || (recent_oi < 0.0 && recent_dollar < 0)
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, value: T, cap: usize) {
    if deque.len() == cap {
        deque.pop_front();
    }
    deque.push_back(value);
}

fn mean_i64(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
}

/// Detects divergences between open interest and price movements.
pub struct OiDivergenceDetector {
    config: OiDivergenceConfig,
    market_state: HashMap<String, OiMarketState>,
}

impl OiDivergenceDetector {
    pub fn new(config: OiDivergenceConfig) -> Self {
        Self {
            config,
            market_state: HashMap::new(),
        }
    }

    pub(crate) fn on_ticker(&mut self, ticker: &KalshiTickerV2) -> Vec<Signal> {
        if ticker.open_interest_delta.is_none() && ticker.price.is_none() {
            return Vec::new();
        }

        let config = self.config.clone();
        let state = self
            .market_state
            .entry(ticker.market_ticker.clone())
            .or_insert_with(|| OiMarketState::new(config.window_size));
        state.update(ticker);

        // Near-certain markets carry no exploitable edge.
        if let Some(price) = state.last_price()
            && (price < config.min_price_for_signal || price > config.max_price_for_signal)
        {
            return Vec::new();
        }

        if state.observation_count() < config.min_observations {
            return Vec::new();
        }

        let Some(regime) = state.classify_regime() else {
            return Vec::new();
        };

        let zscore = state.oi_velocity_zscore();
        if zscore <= config.oi_zscore_threshold {
            return Vec::new();
        }

        let mut confidence = regime.confidence();
        if state.dollar_oi_confirms() {
            confidence = (confidence + config.dollar_oi_confirmation_boost).min(1.0);
        }

        vec![
            Signal::new(
                "oi_divergence",
                &ticker.market_ticker,
                regime.direction(),
                (zscore / 3.0).min(1.0),
                confidence,
                SignalUrgency::Watch,
            )
            .with_metadata(serde_json::json!({
                "regime": regime.as_str(),
                "oi_velocity": state.oi_velocity(),
                "oi_velocity_zscore": zscore,
                "cumulative_oi_delta": state.cumulative_oi_delta,
                "dollar_oi_confirms": state.dollar_oi_confirms(),
                "observation_count": state.observation_count(),
                "last_price": state.last_price(),
            })),
        ]
    }
}

#[async_trait]
impl Processor for OiDivergenceDetector {
    fn name(&self) -> &'static str {
        "oi_divergence"
    }

    fn input_topics(&self) -> &'static [&'static str] {
        &[topics::TICKER_V2]
    }

    fn output_topic(&self) -> &'static str {
        topics::SIGNALS_OI_DIVERGENCE
    }

    async fn process(&mut self, _topic: &'static str, payload: &str) -> Result<Vec<Signal>> {
        let ticker: KalshiTickerV2 = serde_json::from_str(payload)?;
        Ok(self.on_ticker(&ticker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(price: i64, oi_delta: i64, dollar_oi_delta: i64, ts: i64) -> KalshiTickerV2 {
        KalshiTickerV2 {
            market_ticker: "TEST".to_string(),
            price: Some(price),
            volume_delta: None,
            open_interest_delta: Some(oi_delta),
            dollar_volume_delta: None,
            dollar_open_interest_delta: Some(dollar_oi_delta),
            ts,
        }
    }

    #[test]
    fn test_regime_classification() {
        // Rising OI + rising price -> new longs.
        let mut state = OiMarketState::new(50);
        for i in 0..20 {
            state.update(&ticker(40 + i, 5, 250, 1_700_000_000 + i));
        }
        assert_eq!(state.classify_regime(), Some(OiRegime::NewLongs));

        // Rising OI + falling price -> new shorts.
        let mut state = OiMarketState::new(50);
        for i in 0..20 {
            state.update(&ticker(60 - i, 5, 250, 1_700_000_000 + i));
        }
        assert_eq!(state.classify_regime(), Some(OiRegime::NewShorts));

        // Falling OI + rising price -> short covering.
        let mut state = OiMarketState::new(50);
        for i in 0..20 {
            state.update(&ticker(40 + i, -5, -250, 1_700_000_000 + i));
        }
        assert_eq!(state.classify_regime(), Some(OiRegime::ShortCovering));

        // Falling OI + falling price -> long liquidation.
        let mut state = OiMarketState::new(50);
        for i in 0..20 {
            state.update(&ticker(60 - i, -5, -250, 1_700_000_000 + i));
        }
        assert_eq!(state.classify_regime(), Some(OiRegime::LongLiquidation));
    }

    #[test]
    fn test_regime_needs_enough_observations() {
        let mut state = OiMarketState::new(50);
        for i in 0..4 {
            state.update(&ticker(50, 1, 50, 1_700_000_000 + i));
        }
        assert_eq!(state.classify_regime(), None);
    }

    #[test]
    fn test_regime_direction_and_confidence() {
        assert_eq!(OiRegime::NewLongs.direction(), SignalDirection::BuyYes);
        assert_eq!(OiRegime::NewShorts.direction(), SignalDirection::BuyNo);
        assert_eq!(OiRegime::ShortCovering.direction(), SignalDirection::BuyYes);
        assert_eq!(OiRegime::LongLiquidation.direction(), SignalDirection::BuyNo);
        assert_eq!(OiRegime::NewLongs.confidence(), 0.75);
        assert_eq!(OiRegime::ShortCovering.confidence(), 0.45);
    }

    #[test]
    fn test_dollar_oi_confirmation() {
        let mut state = OiMarketState::new(50);
        for i in 0..10 {
            state.update(&ticker(50, 5, 250, 1_700_000_000 + i));
        }
        assert!(state.dollar_oi_confirms());

        let mut state = OiMarketState::new(50);
        for i in 0..10 {
            state.update(&ticker(50, 5, -250, 1_700_000_000 + i));
        }
        assert!(!state.dollar_oi_confirms());
    }

    #[test]
    fn test_extreme_prices_are_skipped() {
        let mut detector = OiDivergenceDetector::new(OiDivergenceConfig::default());
        for i in 0..60 {
            let signals = detector.on_ticker(&ticker(97, 50, 2_500, 1_700_000_000 + i));
            assert!(signals.is_empty());
        }
    }

    #[test]
    fn test_divergence_emits_on_velocity_spike() {
        let mut detector = OiDivergenceDetector::new(OiDivergenceConfig::default());

        // Long calm baseline, then a violent OI expansion with rising price.
        let mut emitted = Vec::new();
        for i in 0..100 {
            emitted.extend(detector.on_ticker(&ticker(45, 1, 45, 1_700_000_000 + i)));
        }
        for i in 0..10 {
            emitted.extend(detector.on_ticker(&ticker(48 + i, 500, 24_000, 1_700_000_200 + i)));
        }

        assert!(!emitted.is_empty(), "expected an oi_divergence signal");
        let signal = &emitted[0];
        assert_eq!(signal.signal_type, "oi_divergence");
        assert_eq!(signal.direction, SignalDirection::BuyYes);
        assert!(signal.strength > 0.0 && signal.strength <= 1.0);
        // Dollar OI agrees, so the confirmation boost applies on top of 0.75.
        assert!(signal.confidence >= 0.75);
    }

    #[test]
    fn test_needs_minimum_observations() {
        let mut detector = OiDivergenceDetector::new(OiDivergenceConfig::default());
        for i in 0..29 {
            let signals = detector.on_ticker(&ticker(50, 100, 5_000, 1_700_000_000 + i));
            assert!(signals.is_empty());
        }
    }
}
