//! Database pool management and schema bootstrap.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::PostgresConfig;
use crate::error::Result;

const SCHEMA_SQL: &str = include_str!("../../schema.sql");

/// Number of insert attempts before a batch is surfaced as failed.
pub(crate) const WRITE_RETRIES: u32 = 3;

/// Backoff after the Nth failed attempt: 2 s, 4 s, 8 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

/// Open a connection pool (min 2 / max 10 by default). Each process owns its
/// own pool.
pub async fn connect_pool(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.dsn())
        .await?;

    info!(
        host = %config.host,
        port = config.port,
        db = %config.db,
        pool_min = config.pool_min,
        pool_max = config.pool_max,
        "db_pool_created"
    );
    Ok(pool)
}

/// Apply the idempotent schema. Safe to run from every process at startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    if let Err(e) = sqlx::raw_sql(SCHEMA_SQL).execute(pool).await {
        warn!(error = %e, "schema_bootstrap_failed");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_schema_contains_core_tables() {
        for table in [
            "trades",
            "ticker_updates",
            "orderbook_snapshots",
            "orderbook_deltas",
            "lifecycle_events",
            "markets",
            "signal_log",
            "composite_log",
            "regime_log",
            "system_health",
            "price_snapshots",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "schema missing table {table}"
            );
        }
    }
}
