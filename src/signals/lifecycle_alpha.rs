//! Lifecycle alpha scanner.
//!
//! Patterns: new-market premium (early prices are often mispriced, traded
//! contrarian), settlement cascades across related markets, and extreme
//! initial prices.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::config::LifecycleAlphaConfig;
use super::processor::Processor;
use crate::bus::topics;
use crate::discovery::SeriesMapper;
use crate::error::Result;
use crate::models::{
    KalshiTickerV2, MarketLifecycleEvent, Signal, SignalDirection, SignalUrgency,
};

/// Pure signal construction for a ticker update on a recently opened market.
pub(crate) fn new_market_price_signals(
    market_ticker: &str,
    price: i64,
    ttl_seconds: i64,
) -> Vec<Signal> {
    let mut signals = Vec::new();

    let distance = (price - 50).abs();
    let contrarian = if price > 50 {
        SignalDirection::BuyNo
    } else {
        SignalDirection::BuyYes
    };

    if distance >= 15 {
        signals.push(
            Signal::new(
                "new_market_open",
                market_ticker,
                contrarian,
                (distance as f64 / 50.0).min(1.0),
                (0.3 + distance as f64 / 100.0).min(0.6),
                SignalUrgency::Watch,
            )
            .with_ttl(ttl_seconds)
            .with_metadata(serde_json::json!({
                "initial_price": price,
                "distance_from_mid": distance,
                "pattern": "new_market_directional",
            })),
        );
    }

    if price <= 20 || price >= 80 {
        signals.push(
            Signal::new(
                "new_market_extreme_price",
                market_ticker,
                contrarian,
                0.5,
                0.35,
                SignalUrgency::Watch,
            )
            .with_ttl(ttl_seconds)
            .with_metadata(serde_json::json!({
                "initial_price": price,
                "pattern": "new_market_extreme_price",
            })),
        );
    }

    signals
}

/// Detects alpha opportunities around market lifecycle transitions.
pub struct LifecycleAlphaScanner {
    config: LifecycleAlphaConfig,
    mapper: SeriesMapper,
    recent_opens: HashMap<String, f64>,
}

impl LifecycleAlphaScanner {
    pub fn new(config: LifecycleAlphaConfig, mapper: SeriesMapper) -> Self {
        Self {
            config,
            mapper,
            recent_opens: HashMap::new(),
        }
    }

    fn on_market_open(&mut self, event: &MarketLifecycleEvent, now: f64) -> Vec<Signal> {
        self.recent_opens.insert(event.market_ticker.clone(), now);

        vec![
            Signal::new(
                "new_market_open",
                &event.market_ticker,
                SignalDirection::Neutral,
                0.4,
                0.4,
                SignalUrgency::Watch,
            )
            .with_ttl(self.config.new_market_window_seconds)
            .with_metadata(serde_json::json!({
                "pattern": "new_market_premium",
                "status": event.event_type,
                "opened_at": now,
            })),
        ]
    }

    /// A market resolved: related markets in the event may need to reprice.
    async fn on_settlement(&mut self, event: &MarketLifecycleEvent) -> Vec<Signal> {
        let related = match self.mapper.get_related_markets(&event.market_ticker).await {
            Ok(related) => related,
            Err(e) => {
                debug!(ticker = %event.market_ticker, error = %e, "related_lookup_failed");
                return Vec::new();
            }
        };

        let signals: Vec<Signal> = related
            .into_iter()
            .filter(|t| *t != event.market_ticker)
            .map(|ticker| {
                Signal::new(
                    "settlement_cascade",
                    &ticker,
                    SignalDirection::Neutral,
                    0.6,
                    0.5,
                    SignalUrgency::Immediate,
                )
                .with_ttl(self.config.settlement_cascade_window_seconds)
                .with_metadata(serde_json::json!({
                    "settled_market": event.market_ticker,
                    "settled_status": event.event_type,
                    "pattern": "settlement_cascade",
                }))
            })
            .collect();

        if !signals.is_empty() {
            info!(
                settled_market = %event.market_ticker,
                related_count = signals.len(),
                "settlement_cascade_detected"
            );
        }
        signals
    }

    fn on_ticker(&mut self, ticker: &KalshiTickerV2, now: f64) -> Vec<Signal> {
        let Some(&opened_at) = self.recent_opens.get(&ticker.market_ticker) else {
            return Vec::new();
        };
        if now - opened_at >= self.config.new_market_window_seconds as f64 {
            return Vec::new();
        }
        let Some(price) = ticker.price else {
            return Vec::new();
        };

        new_market_price_signals(
            &ticker.market_ticker,
            price,
            self.config.new_market_window_seconds,
        )
    }
}

#[async_trait]
impl Processor for LifecycleAlphaScanner {
    fn name(&self) -> &'static str {
        "lifecycle_alpha"
    }

    fn input_topics(&self) -> &'static [&'static str] {
        &[topics::LIFECYCLE, topics::TICKER_V2]
    }

    fn output_topic(&self) -> &'static str {
        topics::SIGNALS_LIFECYCLE
    }

    async fn process(&mut self, topic: &'static str, payload: &str) -> Result<Vec<Signal>> {
        let now = Utc::now().timestamp() as f64;

        match topic {
            topics::LIFECYCLE => {
                let event: MarketLifecycleEvent = serde_json::from_str(payload)?;
                match event.event_type.as_str() {
                    "open" => Ok(self.on_market_open(&event, now)),
                    "settled" | "closed" | "determined" => Ok(self.on_settlement(&event).await),
                    _ => Ok(Vec::new()),
                }
            }
            topics::TICKER_V2 => {
                let ticker: KalshiTickerV2 = serde_json::from_str(payload)?;
                Ok(self.on_ticker(&ticker, now))
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_new_market_price_is_quiet() {
        assert!(new_market_price_signals("M1", 50, 300).is_empty());
        assert!(new_market_price_signals("M1", 60, 300).is_empty());
    }

    #[test]
    fn test_directional_new_market_signal() {
        let signals = new_market_price_signals("M1", 70, 300);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, "new_market_open");
        // Contrarian: price above 50 means buy_no.
        assert_eq!(signals[0].direction, SignalDirection::BuyNo);
        assert_eq!(signals[0].strength, 20.0 / 50.0);
        assert_eq!(signals[0].ttl_seconds, 300);
    }

    #[test]
    fn test_extreme_price_emits_both_signals() {
        let signals = new_market_price_signals("M1", 85, 300);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_type, "new_market_open");
        assert_eq!(signals[1].signal_type, "new_market_extreme_price");
        assert_eq!(signals[1].direction, SignalDirection::BuyNo);
        assert_eq!(signals[1].strength, 0.5);
        assert_eq!(signals[1].confidence, 0.35);

        let signals = new_market_price_signals("M1", 15, 300);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1].direction, SignalDirection::BuyYes);
    }

    #[test]
    fn test_low_extreme_is_contrarian_buy_yes() {
        let signals = new_market_price_signals("M1", 20, 300);
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.direction == SignalDirection::BuyYes));
    }
}
