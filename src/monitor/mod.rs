//! Health checks and price snapshots.

mod health;
mod snapshots;

pub use health::{ComponentHealth, HealthMonitor, HealthStatus};
pub use snapshots::PriceSnapshotService;
