//! Persistence: database pool, batched writers, gap detection, and backfill.

pub mod backfill;
pub mod db;
pub mod gap;
pub mod writers;

pub use backfill::Backfiller;
pub use db::{connect_pool, ensure_schema};
pub use gap::GapDetector;
