//! Writer process: one bus consumer per topic, batch-inserting into the
//! time-series database.

use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::bus::{self, StreamConsumer};
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::persist::{self, writers};
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
    let consumer = StreamConsumer::new(conn.clone());
    let state = StateStore::new(conn);

    let trades = writers::TradeWriter::new(pool.clone(), config.tuning.trade_writer_batch_size)
        .run(consumer.clone());
    let tickers = writers::TickerWriter::new(pool.clone(), state.clone()).run(consumer.clone());
    let orderbooks = writers::OrderbookWriter::new(
        pool.clone(),
        state,
        config.tuning.orderbook_snapshot_interval,
    )
    .run(consumer.clone());
    let lifecycle = writers::LifecycleWriter::new(pool.clone()).run(consumer.clone());
    let signals = writers::SignalWriter::new(pool.clone()).run(consumer.clone());
    let composites = writers::CompositeWriter::new(pool.clone()).run(consumer.clone());
    let regimes = writers::RegimeWriter::new(pool).run(consumer);

    tokio::try_join!(trades, tickers, orderbooks, lifecycle, signals, composites, regimes)?;
    Ok(())
}
