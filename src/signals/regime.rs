//! Microstructure regime detector.
//!
//! Consumes trades, tickers, and orderbook deltas; classifies each market
//! into a regime; refreshes `state:regime:{ticker}`; and emits a
//! `regime_change` signal only when the classification actually changes.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;

use super::config::RegimeConfig;
use super::processor::Processor;
use crate::bus::topics;
use crate::error::Result;
use crate::models::{
    KalshiTickerV2, KalshiTrade, MarketRegime, OrderbookDelta, RegimeSnapshot, Side, Signal,
    SignalDirection, SignalUrgency,
};
use crate::state::StateStore;

const TIMESTAMP_CAP: usize = 200;

/// Per-market features for regime classification.
#[derive(Debug, Default)]
pub(crate) struct RegimeMarketState {
    yes_depth: i64,
    no_depth: i64,
    delta_timestamps: VecDeque<f64>,
    trade_timestamps: VecDeque<f64>,
    last_price: Option<i64>,
    previous_regime: Option<MarketRegime>,
}

impl RegimeMarketState {
    pub(crate) fn update_from_delta(&mut self, delta: &OrderbookDelta, now: f64) {
        push_ts(&mut self.delta_timestamps, now);
        match delta.side {
            Side::Yes => self.yes_depth = (self.yes_depth + delta.delta).max(0),
            Side::No => self.no_depth = (self.no_depth + delta.delta).max(0),
        }
    }

    pub(crate) fn update_from_trade(&mut self, trade: &KalshiTrade, now: f64) {
        push_ts(&mut self.trade_timestamps, now);
        self.last_price = Some(trade.yes_price);
    }

    pub(crate) fn update_from_ticker(&mut self, ticker: &KalshiTickerV2) {
        if let Some(price) = ticker.price {
            self.last_price = Some(price);
        }
    }

    /// Messages per second over the last 60 seconds.
    pub(crate) fn message_rate(&self, now: f64) -> f64 {
        let recent = self
            .delta_timestamps
            .iter()
            .chain(self.trade_timestamps.iter())
            .filter(|&&t| now - t <= 60.0)
            .count();
        recent as f64 / 60.0
    }

    /// Trades per minute over the last 5 minutes.
    pub(crate) fn trade_rate(&self, now: f64) -> f64 {
        let recent = self
            .trade_timestamps
            .iter()
            .filter(|&&t| now - t <= 300.0)
            .count();
        recent as f64 / 5.0
    }

    /// `-1` (all no depth) to `+1` (all yes depth); `0` when balanced or empty.
    pub(crate) fn depth_imbalance(&self) -> f64 {
        let total = self.yes_depth + self.no_depth;
        if total == 0 {
            return 0.0;
        }
        (self.yes_depth - self.no_depth) as f64 / total as f64
    }

    /// Classification precedence: pre-settlement, dead, informed, active, quiet.
    pub(crate) fn classify(&self, config: &RegimeConfig, now: f64) -> MarketRegime {
        let trade_rate = self.trade_rate(now);
        let message_rate = self.message_rate(now);

        if let Some(price) = self.last_price {
            let threshold = config.pre_settle_price_threshold;
            if (price <= threshold || price >= 100 - threshold)
                && trade_rate > config.pre_settle_trade_rate
            {
                return MarketRegime::PreSettlement;
            }
        }

        if trade_rate < config.dead_trade_rate && message_rate < config.dead_message_rate {
            return MarketRegime::Dead;
        }

        if self.depth_imbalance().abs() > config.informed_imbalance
            && trade_rate > config.informed_trade_rate
        {
            return MarketRegime::Informed;
        }

        if trade_rate > config.active_trade_rate && message_rate > config.active_message_rate {
            return MarketRegime::Active;
        }

        MarketRegime::Quiet
    }

    pub(crate) fn snapshot(&self, regime: MarketRegime, now: f64) -> RegimeSnapshot {
        RegimeSnapshot {
            regime,
            depth_imbalance: self.depth_imbalance(),
            trade_rate: self.trade_rate(now),
            message_rate: self.message_rate(now),
            last_price: self.last_price,
            yes_depth: self.yes_depth,
            no_depth: self.no_depth,
            ts: now,
        }
    }
}

fn push_ts(deque: &mut VecDeque<f64>, now: f64) {
    if deque.len() == TIMESTAMP_CAP {
        deque.pop_front();
    }
    deque.push_back(now);
}

/// The in-memory classification engine, independent of any I/O.
#[derive(Debug)]
pub(crate) struct RegimeEngine {
    config: RegimeConfig,
    market_state: HashMap<String, RegimeMarketState>,
    last_publish: HashMap<String, f64>,
}

impl RegimeEngine {
    pub(crate) fn new(config: RegimeConfig) -> Self {
        Self {
            config,
            market_state: HashMap::new(),
            last_publish: HashMap::new(),
        }
    }

    pub(crate) fn state_for(&mut self, ticker: &str) -> &mut RegimeMarketState {
        self.market_state.entry(ticker.to_string()).or_default()
    }

    /// Rate-limited per-market evaluation. A fresh summary is returned on
    /// every publish-interval tick; a signal only on a regime transition.
    pub(crate) fn evaluate(
        &mut self,
        ticker: &str,
        now: f64,
    ) -> (Option<RegimeSnapshot>, Vec<Signal>) {
        let last = self.last_publish.get(ticker).copied().unwrap_or(0.0);
        if now - last < self.config.publish_interval_seconds {
            return (None, Vec::new());
        }
        self.last_publish.insert(ticker.to_string(), now);

        let config = self.config.clone();
        let state = self.state_for(ticker);
        let regime = state.classify(&config, now);
        let snapshot = state.snapshot(regime, now);

        let previous = state.previous_regime;
        if previous == Some(regime) {
            return (Some(snapshot), Vec::new());
        }
        state.previous_regime = Some(regime);

        let old_regime = previous.unwrap_or(MarketRegime::Unknown);
        let urgency = if regime == MarketRegime::Informed {
            SignalUrgency::Immediate
        } else {
            SignalUrgency::Background
        };

        let signal = Signal::new(
            "regime_change",
            ticker,
            SignalDirection::Neutral,
            0.5,
            0.8,
            urgency,
        )
        .with_metadata(serde_json::json!({
            "new_regime": regime.as_str(),
            "old_regime": old_regime.as_str(),
            "trade_rate": snapshot.trade_rate,
            "message_rate": snapshot.message_rate,
            "depth_imbalance": snapshot.depth_imbalance,
            "last_price": snapshot.last_price,
        }));

        (Some(snapshot), vec![signal])
    }
}

/// Classifies each market's microstructure regime. A meta-signal: it tells
/// the aggregator how to weigh everything else.
pub struct RegimeDetector {
    engine: RegimeEngine,
    state_store: StateStore,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig, state_store: StateStore) -> Self {
        Self {
            engine: RegimeEngine::new(config),
            state_store,
        }
    }

    async fn evaluate_and_store(&mut self, ticker: &str) -> Result<Vec<Signal>> {
        let now = Utc::now().timestamp() as f64;
        let (snapshot, signals) = self.engine.evaluate(ticker, now);
        if let Some(snapshot) = snapshot {
            self.state_store.set_regime(ticker, &snapshot).await?;
        }
        Ok(signals)
    }
}

#[async_trait]
impl Processor for RegimeDetector {
    fn name(&self) -> &'static str {
        "regime"
    }

    fn input_topics(&self) -> &'static [&'static str] {
        &[topics::ORDERBOOK_DELTAS, topics::TRADES, topics::TICKER_V2]
    }

    fn output_topic(&self) -> &'static str {
        topics::SIGNALS_REGIME
    }

    async fn process(&mut self, topic: &'static str, payload: &str) -> Result<Vec<Signal>> {
        let now = Utc::now().timestamp() as f64;

        let ticker = match topic {
            topics::ORDERBOOK_DELTAS => {
                let delta: OrderbookDelta = serde_json::from_str(payload)?;
                self.engine
                    .state_for(&delta.market_ticker)
                    .update_from_delta(&delta, now);
                delta.market_ticker
            }
            topics::TRADES => {
                let trade: KalshiTrade = serde_json::from_str(payload)?;
                self.engine
                    .state_for(&trade.market_ticker)
                    .update_from_trade(&trade, now);
                trade.market_ticker
            }
            topics::TICKER_V2 => {
                let update: KalshiTickerV2 = serde_json::from_str(payload)?;
                self.engine
                    .state_for(&update.market_ticker)
                    .update_from_ticker(&update);
                update.market_ticker
            }
            _ => return Ok(Vec::new()),
        };

        self.evaluate_and_store(&ticker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(side: Side, qty: i64) -> OrderbookDelta {
        OrderbookDelta {
            market_ticker: "TEST".to_string(),
            price: 50,
            delta: qty,
            side,
            ts: None,
            client_order_id: None,
        }
    }

    fn trade(price: i64) -> KalshiTrade {
        KalshiTrade {
            trade_id: "t".to_string(),
            market_ticker: "TEST".to_string(),
            yes_price: price,
            no_price: 100 - price,
            count: 1,
            taker_side: Side::Yes,
            ts: 1_700_000_000,
            yes_price_dollars: None,
            no_price_dollars: None,
            count_fp: None,
        }
    }

    fn config() -> RegimeConfig {
        RegimeConfig {
            publish_interval_seconds: 30.0,
            dead_trade_rate: 0.2,
            dead_message_rate: 0.1,
            informed_imbalance: 0.6,
            informed_trade_rate: 5.0,
            active_trade_rate: 2.0,
            active_message_rate: 0.5,
            pre_settle_price_threshold: 5,
            pre_settle_trade_rate: 2.0,
        }
    }

    #[test]
    fn test_dead_market() {
        let state = RegimeMarketState::default();
        assert_eq!(state.classify(&config(), 1_000.0), MarketRegime::Dead);
    }

    #[test]
    fn test_quiet_market() {
        let mut state = RegimeMarketState::default();
        // A couple of trades: above the dead threshold, below active.
        state.update_from_trade(&trade(50), 990.0);
        state.update_from_trade(&trade(50), 995.0);
        assert_eq!(state.classify(&config(), 1_000.0), MarketRegime::Quiet);
    }

    #[test]
    fn test_active_market() {
        let mut state = RegimeMarketState::default();
        // 11 trades in 5 minutes -> rate 2.2; plus delta flow for message rate.
        for i in 0..11 {
            state.update_from_trade(&trade(50), 950.0 + i as f64);
        }
        for i in 0..40 {
            state.update_from_delta(&delta(Side::Yes, 10), 950.0 + i as f64);
            state.update_from_delta(&delta(Side::No, 10), 950.0 + i as f64);
        }
        assert_eq!(state.classify(&config(), 1_000.0), MarketRegime::Active);
    }

    #[test]
    fn test_informed_market() {
        let mut state = RegimeMarketState::default();
        for i in 0..30 {
            state.update_from_trade(&trade(50), 950.0 + i as f64);
        }
        // One-sided depth: imbalance 1.0.
        for i in 0..30 {
            state.update_from_delta(&delta(Side::Yes, 100), 950.0 + i as f64);
        }
        assert_eq!(state.classify(&config(), 1_000.0), MarketRegime::Informed);
    }

    #[test]
    fn test_pre_settlement_takes_precedence() {
        let mut state = RegimeMarketState::default();
        for i in 0..30 {
            state.update_from_trade(&trade(97), 950.0 + i as f64);
        }
        for i in 0..30 {
            state.update_from_delta(&delta(Side::Yes, 100), 950.0 + i as f64);
        }
        // Extreme price + active tape beats the informed classification.
        assert_eq!(
            state.classify(&config(), 1_000.0),
            MarketRegime::PreSettlement
        );
    }

    #[test]
    fn test_depth_never_negative() {
        let mut state = RegimeMarketState::default();
        state.update_from_delta(&delta(Side::Yes, -500), 0.0);
        assert_eq!(state.depth_imbalance(), 0.0);
    }

    #[test]
    fn test_signal_only_on_regime_change() {
        let mut engine = RegimeEngine::new(config());

        // First evaluation: Dead (from Unknown) -> one signal.
        let (snap, signals) = engine.evaluate("TEST", 1_000.0);
        assert!(snap.is_some());
        assert_eq!(signals.len(), 1);
        assert_eq!(
            signals[0].metadata.get("new_regime").and_then(|v| v.as_str()),
            Some("dead")
        );
        assert_eq!(
            signals[0].metadata.get("old_regime").and_then(|v| v.as_str()),
            Some("unknown")
        );
        assert_eq!(signals[0].direction, SignalDirection::Neutral);

        // Within the publish interval: nothing at all.
        let (snap, signals) = engine.evaluate("TEST", 1_010.0);
        assert!(snap.is_none());
        assert!(signals.is_empty());

        // Past the interval but still Dead: summary refresh, no signal.
        let (snap, signals) = engine.evaluate("TEST", 1_040.0);
        assert!(snap.is_some());
        assert!(signals.is_empty());
    }

    #[test]
    fn test_urgency_for_informed_transition() {
        let mut engine = RegimeEngine::new(config());
        {
            let state = engine.state_for("TEST");
            for i in 0..30 {
                state.update_from_trade(&trade(50), 950.0 + i as f64);
                state.update_from_delta(&delta(Side::Yes, 100), 950.0 + i as f64);
            }
        }
        let (_, signals) = engine.evaluate("TEST", 1_000.0);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].urgency, SignalUrgency::Immediate);
    }
}
