//! Signal process: runs the five stateful signal processors.

use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::bus::{self, SignalReader, StreamConsumer, StreamPublisher};
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::discovery::SeriesMapper;
use kalshi_alpha_rs::persist;
use kalshi_alpha_rs::signals::{
    CrossMarketEngine, FlowToxicityClassifier, LifecycleAlphaScanner, OiDivergenceDetector,
    RegimeDetector, config as signal_config, run_processor,
};
use kalshi_alpha_rs::state::StateStore;

#[tokio::main]
async fn main() -> kalshi_alpha_rs::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;

    let conn = bus::connect(&config.redis).await?;
    let consumer = StreamConsumer::new(conn.clone());
    let state = StateStore::new(conn.clone());

    let pool = persist::connect_pool(&config.postgres).await?;
    persist::ensure_schema(&pool).await?;
    let mapper = SeriesMapper::new(pool, state.clone());
    let reader = SignalReader::new(conn.clone());

    let toxicity = run_processor(
        FlowToxicityClassifier::new(signal_config::FlowToxicityConfig::default()),
        consumer.clone(),
        StreamPublisher::new(conn.clone()),
    );
    let oi = run_processor(
        OiDivergenceDetector::new(signal_config::OiDivergenceConfig::default()),
        consumer.clone(),
        StreamPublisher::new(conn.clone()),
    );
    let regime = run_processor(
        RegimeDetector::new(signal_config::RegimeConfig::default(), state),
        consumer.clone(),
        StreamPublisher::new(conn.clone()),
    );
    let cross_market = run_processor(
        CrossMarketEngine::new(
            signal_config::CrossMarketConfig::default(),
            mapper.clone(),
            reader,
        ),
        consumer.clone(),
        StreamPublisher::new(conn.clone()),
    );
    let lifecycle = run_processor(
        LifecycleAlphaScanner::new(signal_config::LifecycleAlphaConfig::default(), mapper),
        consumer,
        StreamPublisher::new(conn),
    );

    tokio::try_join!(toxicity, oi, regime, cross_market, lifecycle)?;
    Ok(())
}
