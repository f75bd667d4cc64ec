//! Monitoring process: component health checks and price snapshots.

use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::bus::{self, StreamConsumer, StreamPublisher};
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::monitor::{HealthMonitor, PriceSnapshotService};
use kalshi_alpha_rs::persist;
use kalshi_alpha_rs::state::StateStore;

#[tokio::main]
async fn main() -> kalshi_alpha_rs::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;

    let pool = persist::connect_pool(&config.postgres).await?;
    persist::ensure_schema(&pool).await?;

    let conn = bus::connect(&config.redis).await?;
    let state = StateStore::new(conn.clone());

    let health = HealthMonitor::new(
        state.clone(),
        StreamConsumer::new(conn.clone()),
        StreamPublisher::new(conn),
        pool.clone(),
        config.monitoring.clone(),
    )
    .run();
    let snapshots = PriceSnapshotService::new(state, pool).run();

    tokio::try_join!(health, snapshots)?;
    Ok(())
}
