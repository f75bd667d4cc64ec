//! Aggregator process: folds `kalshi:signals:all` into composite scores.

use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::bus::{self, StreamConsumer, StreamPublisher};
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::signals::{Aggregator, config::AggregatorConfig};
use kalshi_alpha_rs::state::StateStore;

#[tokio::main]
async fn main() -> kalshi_alpha_rs::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;

    let conn = bus::connect(&config.redis).await?;
    let aggregator = Aggregator::new(
        AggregatorConfig::default(),
        StateStore::new(conn.clone()),
        StreamPublisher::new(conn.clone()),
        StreamConsumer::new(conn),
    );

    aggregator.run().await
}
