//! Stateful signal processors and the composite aggregator.
//!
//! Each processor consumes raw market-data topics, maintains bounded
//! per-market rolling state, and emits [`crate::models::Signal`]s to its own
//! topic plus the `kalshi:signals:all` fan-in. The aggregator folds the
//! fan-in into regime-weighted composite scores.

pub mod aggregator;
pub mod config;
pub mod lifecycle_alpha;
pub mod oi_divergence;
pub mod processor;
pub mod propagation;
pub mod regime;
pub mod toxicity;

pub use aggregator::Aggregator;
pub use lifecycle_alpha::LifecycleAlphaScanner;
pub use oi_divergence::OiDivergenceDetector;
pub use processor::{Processor, run_processor};
pub use propagation::CrossMarketEngine;
pub use regime::RegimeDetector;
pub use toxicity::FlowToxicityClassifier;
