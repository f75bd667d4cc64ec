//! Data models for exchange messages, market metadata, and signals.
//!
//! All prices are in cents (0-99). Fields ending in `_dollars` are
//! fixed-point dollar strings passed through from the exchange.

mod common;
mod lifecycle;
mod market;
mod orderbook;
mod signal;
mod ticker;
mod trade;

pub use common::Side;
pub use lifecycle::{EventLifecycleEvent, MarketLifecycleEvent};
pub use market::KalshiMarket;
pub use orderbook::{OrderbookDelta, OrderbookSnapshot, OrderbookState, PriceLevel};
pub use signal::{
    CompositeSignal, MarketRegime, RegimeSnapshot, Signal, SignalDirection, SignalUrgency,
};
pub use ticker::KalshiTickerV2;
pub use trade::KalshiTrade;
