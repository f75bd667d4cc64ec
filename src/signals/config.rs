//! Tuning parameters for the signal processors and the aggregator.

#[derive(Debug, Clone)]
pub struct FlowToxicityConfig {
    pub vpin_threshold: f64,
    pub rolling_vpin_threshold: f64,
    pub bucket_size: i64,
    pub window_size: usize,
    pub burst_window_seconds: f64,
    pub burst_min_trades: usize,
    pub size_multiplier: f64,
    pub min_market_volume: i64,
}

impl Default for FlowToxicityConfig {
    fn default() -> Self {
        Self {
            vpin_threshold: 0.80,
            rolling_vpin_threshold: 0.70,
            bucket_size: 25,
            window_size: 20,
            burst_window_seconds: 5.0,
            burst_min_trades: 8,
            size_multiplier: 3.0,
            min_market_volume: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OiDivergenceConfig {
    pub min_observations: u64,
    pub oi_zscore_threshold: f64,
    pub window_size: usize,
    pub dollar_oi_confirmation_boost: f64,
    pub min_price_for_signal: i64,
    pub max_price_for_signal: i64,
}

impl Default for OiDivergenceConfig {
    fn default() -> Self {
        Self {
            min_observations: 30,
            oi_zscore_threshold: 2.5,
            window_size: 50,
            dollar_oi_confirmation_boost: 0.15,
            min_price_for_signal: 5,
            max_price_for_signal: 95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub publish_interval_seconds: f64,
    pub dead_trade_rate: f64,
    pub dead_message_rate: f64,
    pub informed_imbalance: f64,
    pub informed_trade_rate: f64,
    pub active_trade_rate: f64,
    pub active_message_rate: f64,
    pub pre_settle_price_threshold: i64,
    pub pre_settle_trade_rate: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
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
}

#[derive(Debug, Clone)]
pub struct CrossMarketConfig {
    pub min_price_move: i64,
    pub propagation_window_seconds: f64,
    pub signal_attenuation: f64,
    pub confidence_attenuation: f64,
    pub max_related_markets: usize,
    pub min_source_strength: f64,
}

impl Default for CrossMarketConfig {
    fn default() -> Self {
        Self {
            min_price_move: 3,
            propagation_window_seconds: 30.0,
            signal_attenuation: 0.7,
            confidence_attenuation: 0.6,
            max_related_markets: 20,
            min_source_strength: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleAlphaConfig {
    pub new_market_window_seconds: i64,
    pub settlement_cascade_window_seconds: i64,
}

impl Default for LifecycleAlphaConfig {
    fn default() -> Self {
        Self {
            new_market_window_seconds: 300,
            settlement_cascade_window_seconds: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub min_composite_score: f64,
    pub cleanup_interval_seconds: u64,
    pub max_active_signals_per_market: usize,
    pub publish_cooldown_seconds: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_composite_score: 0.4,
            cleanup_interval_seconds: 60,
            max_active_signals_per_market: 20,
            publish_cooldown_seconds: 10.0,
        }
    }
}
