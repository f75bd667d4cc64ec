//! Signal aggregator: fuses live per-market signals into regime-weighted
//! composite scores.
//!
//! Consumes `kalshi:signals:all`, keeps a bounded list of live signals per
//! market, reads the current regime from the state store, and publishes a
//! composite to `kalshi:signals:composite` at most once per market per
//! cooldown window, and only when the score clears the actionability
//! threshold.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::AggregatorConfig;
use crate::bus::{
    DEFAULT_BATCH_SIZE, StreamConsumer, StreamEntry, StreamHandler, StreamPublisher, topics,
};
use crate::error::{Error, Result};
use crate::models::{CompositeSignal, MarketRegime, Signal, SignalDirection};

const CONSUMER_GROUP: &str = "aggregator";
const CONSUMER_NAME: &str = "aggregator_1";
const QUEUE_CAPACITY: usize = 1_024;

/// Contribution weight per signal type. Types absent from the table get 0.1.
pub(crate) fn base_weight(signal_type: &str) -> f64 {
    match signal_type {
        "flow_toxicity" => 0.35,
        "oi_divergence" => 0.30,
        "cross_market_propagation" => 0.15,
        "settlement_cascade" => 0.15,
        "signal_propagation" => 0.10,
        "flow_burst" => 0.08,
        "new_market_extreme_price" => 0.05,
        "flow_large_trade" => 0.05,
        "regime_change" => 0.05,
        "new_market_open" => 0.02,
        _ => 0.10,
    }
}

/// Regime multiplier per signal type. Unknown combinations default to 1.0.
pub(crate) fn regime_modifier(regime: MarketRegime, signal_type: &str) -> f64 {
    match (regime, signal_type) {
        (MarketRegime::Dead, "flow_toxicity") => 0.5,
        (MarketRegime::Dead, "oi_divergence") => 0.7,
        (MarketRegime::Dead, "cross_market_propagation") => 1.2,

        (MarketRegime::Quiet, "flow_toxicity") => 0.8,
        (MarketRegime::Quiet, "oi_divergence") => 0.9,
        (MarketRegime::Quiet, "cross_market_propagation") => 1.1,

        (MarketRegime::Informed, "flow_toxicity") => 1.5,
        (MarketRegime::Informed, "oi_divergence") => 1.3,
        (MarketRegime::Informed, "cross_market_propagation") => 0.8,

        (MarketRegime::PreSettlement, "flow_toxicity") => 0.8,
        (MarketRegime::PreSettlement, "oi_divergence") => 0.5,

        _ => 1.0,
    }
}

/// Direction from a composite score: a ±0.1 dead zone maps to neutral.
pub(crate) fn score_direction(score: f64) -> SignalDirection {
    if score > 0.1 {
        SignalDirection::BuyYes
    } else if score < -0.1 {
        SignalDirection::BuyNo
    } else {
        SignalDirection::Neutral
    }
}

/// Compute the regime-weighted composite over a market's live signals.
///
/// Returns `None` when there are no signals or every contribution has zero
/// weight. The score is clamped to `[-1, 1]`.
pub(crate) fn compute_composite(
    market_ticker: &str,
    active: &[Signal],
    regime: MarketRegime,
    now: DateTime<Utc>,
) -> Option<CompositeSignal> {
    if active.is_empty() {
        return None;
    }

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for signal in active {
        let weight =
            base_weight(&signal.signal_type) * regime_modifier(regime, &signal.signal_type)
                * signal.confidence;
        weighted_sum += signal.strength * signal.direction.multiplier() * weight;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return None;
    }

    let composite_score = (weighted_sum / total_weight).clamp(-1.0, 1.0);

    Some(CompositeSignal {
        market_ticker: market_ticker.to_string(),
        event_ticker: active.iter().find_map(|s| s.event_ticker.clone()),
        series_ticker: active.iter().find_map(|s| s.series_ticker.clone()),
        direction: score_direction(composite_score),
        composite_score,
        active_signals: active.to_vec(),
        regime,
        ts: now,
    })
}

/// In-memory aggregation state, independent of any I/O.
pub(crate) struct AggregatorState {
    config: AggregatorConfig,
    active_signals: HashMap<String, Vec<Signal>>,
    last_publish: HashMap<String, f64>,
}

impl AggregatorState {
    pub(crate) fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            active_signals: HashMap::new(),
            last_publish: HashMap::new(),
        }
    }

    /// Fold in a signal; returns a composite to publish, or `None` when the
    /// market is inside its cooldown or below the actionability threshold.
    pub(crate) fn on_signal(
        &mut self,
        signal: Signal,
        regime: MarketRegime,
        now: DateTime<Utc>,
    ) -> Option<CompositeSignal> {
        let ticker = signal.market_ticker.clone();
        let list = self.active_signals.entry(ticker.clone()).or_default();
        list.push(signal);

        // Cap to the most recent, then drop anything expired.
        let cap = self.config.max_active_signals_per_market;
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(..excess);
        }
        list.retain(|s| !s.is_expired_at(now));

        let now_secs = now.timestamp() as f64;
        let last = self.last_publish.get(&ticker).copied().unwrap_or(0.0);
        if now_secs - last < self.config.publish_cooldown_seconds {
            return None;
        }

        let composite = compute_composite(&ticker, list, regime, now)?;
        if composite.composite_score.abs() < self.config.min_composite_score {
            return None;
        }

        self.last_publish.insert(ticker, now_secs);
        Some(composite)
    }

    /// Drop expired signals and forget markets whose list emptied out.
    pub(crate) fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let mut cleaned = 0;
        self.active_signals.retain(|_, list| {
            list.retain(|s| !s.is_expired_at(now));
            if list.is_empty() {
                cleaned += 1;
                false
            } else {
                true
            }
        });
        cleaned
    }
}

/// Forwards consumed fan-in entries into the aggregator's queue.
struct QueueForwarder {
    tx: mpsc::Sender<StreamEntry>,
}

#[async_trait::async_trait]
impl StreamHandler for QueueForwarder {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        for entry in entries {
            self.tx
                .send(entry.clone())
                .await
                .map_err(|_| Error::Parse("aggregator queue closed".to_string()))?;
        }
        Ok(())
    }
}

/// The aggregator service.
pub struct Aggregator {
    state: AggregatorState,
    store: crate::state::StateStore,
    publisher: StreamPublisher,
    consumer: StreamConsumer,
    cleanup_interval: u64,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        store: crate::state::StateStore,
        publisher: StreamPublisher,
        consumer: StreamConsumer,
    ) -> Self {
        let cleanup_interval = config.cleanup_interval_seconds;
        Self {
            state: AggregatorState::new(config),
            store,
            publisher,
            consumer,
            cleanup_interval,
        }
    }

    async fn current_regime(&self, ticker: &str) -> MarketRegime {
        match self.store.regime(ticker).await {
            Ok(Some(snapshot)) => snapshot.regime,
            Ok(None) => MarketRegime::Unknown,
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "regime_read_failed");
                MarketRegime::Unknown
            }
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("aggregator_starting");

        let (tx, mut rx) = mpsc::channel::<StreamEntry>(QUEUE_CAPACITY);
        let mut consumer = self.consumer.clone();
        let reader = tokio::spawn(async move {
            let mut forwarder = QueueForwarder { tx };
            consumer
                .consume(
                    topics::SIGNALS_ALL,
                    CONSUMER_GROUP,
                    CONSUMER_NAME,
                    DEFAULT_BATCH_SIZE,
                    &mut forwarder,
                )
                .await
        });

        let cleanup_period = std::time::Duration::from_secs(self.cleanup_interval.max(1));
        let mut cleanup_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + cleanup_period,
            cleanup_period,
        );

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    let Some(entry) = entry else { break };

                    let signal: Signal = match serde_json::from_str(&entry.data) {
                        Ok(signal) => signal,
                        Err(e) => {
                            debug!(id = %entry.id, error = %e, "signal_parse_skip");
                            continue;
                        }
                    };

                    let regime = self.current_regime(&signal.market_ticker).await;
                    if let Some(composite) = self.state.on_signal(signal, regime, Utc::now()) {
                        self.publisher
                            .publish(topics::SIGNALS_COMPOSITE, &composite)
                            .await?;
                        info!(
                            market = %composite.market_ticker,
                            direction = composite.direction.as_str(),
                            score = composite.composite_score,
                            signal_count = composite.active_signals.len(),
                            regime = %composite.regime,
                            "composite_published"
                        );
                    }
                }

                _ = cleanup_timer.tick() => {
                    let cleaned = self.state.cleanup(Utc::now());
                    if cleaned > 0 {
                        debug!(markets_cleaned = cleaned, "cleanup_done");
                    }
                }
            }
        }

        reader.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalUrgency;
    use chrono::Duration;

    fn signal(
        signal_type: &str,
        direction: SignalDirection,
        strength: f64,
        confidence: f64,
    ) -> Signal {
        Signal::new(
            signal_type,
            "M1",
            direction,
            strength,
            confidence,
            SignalUrgency::Watch,
        )
    }

    #[test]
    fn test_conflicting_composite_lands_in_dead_zone() {
        // flow_toxicity buy_yes 0.8/0.7 vs oi_divergence buy_no 0.9/0.8 in an
        // active regime: score ~= -0.041, direction neutral, below the 0.4
        // publish threshold.
        let signals = vec![
            signal("flow_toxicity", SignalDirection::BuyYes, 0.8, 0.7),
            signal("oi_divergence", SignalDirection::BuyNo, 0.9, 0.8),
        ];

        let composite =
            compute_composite("M1", &signals, MarketRegime::Active, Utc::now()).unwrap();

        assert!((composite.composite_score - (-0.020 / 0.485)).abs() < 1e-9);
        assert_eq!(composite.direction, SignalDirection::Neutral);
        assert!(composite.composite_score.abs() < 0.4);

        // Through the stateful path nothing is published.
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();
        assert!(state.on_signal(signals[0].clone(), MarketRegime::Active, now).is_none());
        assert!(state.on_signal(signals[1].clone(), MarketRegime::Active, now).is_none());
    }

    #[test]
    fn test_strong_agreement_publishes() {
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();

        let composite = state.on_signal(
            signal("flow_toxicity", SignalDirection::BuyYes, 1.0, 0.9),
            MarketRegime::Active,
            now,
        );
        let composite = composite.expect("single strong signal publishes");
        assert_eq!(composite.direction, SignalDirection::BuyYes);
        assert_eq!(composite.composite_score, 1.0);
        assert_eq!(composite.regime, MarketRegime::Active);
    }

    #[test]
    fn test_publish_cooldown() {
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();

        let first = state.on_signal(
            signal("flow_toxicity", SignalDirection::BuyYes, 1.0, 0.9),
            MarketRegime::Active,
            now,
        );
        assert!(first.is_some());

        // 5 s later: inside the 10 s cooldown.
        let second = state.on_signal(
            signal("flow_toxicity", SignalDirection::BuyYes, 1.0, 0.9),
            MarketRegime::Active,
            now + Duration::seconds(5),
        );
        assert!(second.is_none());

        // 15 s later: cooldown expired.
        let third = state.on_signal(
            signal("flow_toxicity", SignalDirection::BuyYes, 1.0, 0.9),
            MarketRegime::Active,
            now + Duration::seconds(15),
        );
        assert!(third.is_some());
    }

    #[test]
    fn test_expired_signals_are_excluded() {
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();

        let mut stale = signal("flow_toxicity", SignalDirection::BuyNo, 1.0, 0.9);
        stale.ts = now - Duration::seconds(400); // past the 300 s TTL

        let fresh = signal("oi_divergence", SignalDirection::BuyYes, 1.0, 0.9);

        let composite = state
            .on_signal(stale, MarketRegime::Active, now)
            .or_else(|| {
                // The expired signal alone cannot publish; the fresh one
                // computes over the pruned list.
                state.last_publish.clear();
                state.on_signal(fresh, MarketRegime::Active, now)
            })
            .expect("fresh signal publishes");

        assert_eq!(composite.active_signals.len(), 1);
        assert_eq!(composite.direction, SignalDirection::BuyYes);
        assert_eq!(composite.composite_score, 1.0);
    }

    #[test]
    fn test_active_signal_cap() {
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();

        for _ in 0..30 {
            state.on_signal(
                signal("flow_burst", SignalDirection::Neutral, 0.1, 0.1),
                MarketRegime::Quiet,
                now,
            );
        }
        assert!(state.active_signals.get("M1").unwrap().len() <= 20);
    }

    #[test]
    fn test_neutral_dead_zone_boundaries() {
        assert_eq!(score_direction(0.05), SignalDirection::Neutral);
        assert_eq!(score_direction(-0.1), SignalDirection::Neutral);
        assert_eq!(score_direction(0.1), SignalDirection::Neutral);
        assert_eq!(score_direction(0.11), SignalDirection::BuyYes);
        assert_eq!(score_direction(-0.2), SignalDirection::BuyNo);
    }

    #[test]
    fn test_regime_modifiers() {
        assert_eq!(regime_modifier(MarketRegime::Informed, "flow_toxicity"), 1.5);
        assert_eq!(regime_modifier(MarketRegime::Dead, "flow_toxicity"), 0.5);
        assert_eq!(
            regime_modifier(MarketRegime::Informed, "cross_market_propagation"),
            0.8
        );
        // Unknown combinations default to 1.0.
        assert_eq!(regime_modifier(MarketRegime::Unknown, "flow_toxicity"), 1.0);
        assert_eq!(regime_modifier(MarketRegime::Active, "anything"), 1.0);
    }

    #[test]
    fn test_base_weights() {
        assert_eq!(base_weight("flow_toxicity"), 0.35);
        assert_eq!(base_weight("oi_divergence"), 0.30);
        assert_eq!(base_weight("new_market_open"), 0.02);
        assert_eq!(base_weight("never_heard_of_it"), 0.10);
    }

    #[test]
    fn test_cleanup_drops_empty_markets() {
        let mut state = AggregatorState::new(AggregatorConfig::default());
        let now = Utc::now();

        state.on_signal(
            signal("flow_burst", SignalDirection::Neutral, 0.1, 0.1),
            MarketRegime::Quiet,
            now,
        );
        assert_eq!(state.active_signals.len(), 1);

        // Everything has expired ten minutes later.
        let cleaned = state.cleanup(now + Duration::seconds(600));
        assert_eq!(cleaned, 1);
        assert!(state.active_signals.is_empty());
    }

    #[test]
    fn test_all_neutral_signals_score_zero() {
        let signals = vec![
            signal("regime_change", SignalDirection::Neutral, 0.5, 0.8),
            signal("new_market_open", SignalDirection::Neutral, 0.4, 0.4),
        ];
        let composite =
            compute_composite("M1", &signals, MarketRegime::Quiet, Utc::now()).unwrap();
        assert_eq!(composite.composite_score, 0.0);
        assert_eq!(composite.direction, SignalDirection::Neutral);
    }
}
