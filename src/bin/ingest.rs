//! Ingestion process: WebSocket ingest plus market discovery and dynamic
//! subscription management.

use tracing::error;
use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::auth::AuthSigner;
use kalshi_alpha_rs::bus::{self, StreamPublisher};
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::discovery::{MarketScanner, SeriesMapper, SubscriptionManager, run_discovery};
use kalshi_alpha_rs::ingest::WsIngest;
use kalshi_alpha_rs::persist;
use kalshi_alpha_rs::rest::RestClient;
use kalshi_alpha_rs::state::StateStore;

#[tokio::main]
async fn main() -> kalshi_alpha_rs::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    let signer = AuthSigner::from_pem_file(&config.kalshi.api_key_id, &config.kalshi.private_key_path)?;

    let conn = bus::connect(&config.redis).await?;
    let publisher = StreamPublisher::new(conn.clone());
    let state = StateStore::new(conn);

    let pool = persist::connect_pool(&config.postgres).await?;
    persist::ensure_schema(&pool).await?;

    let (ingest, handle) = WsIngest::new(
        signer.clone(),
        publisher,
        state.clone(),
        config.kalshi.clone(),
        config.tuning.clone(),
    );

    let rest = RestClient::new(signer, config.kalshi.api_base_url.clone())?;
    let scanner = MarketScanner::new(rest, pool.clone(), state.clone());
    let subscriptions = SubscriptionManager::new(handle, pool.clone());
    let mapper = SeriesMapper::new(pool, state);

    let scan_interval = config.tuning.market_scan_interval;
    let discovery = tokio::spawn(run_discovery(scanner, subscriptions, mapper, scan_interval));
    let ws = tokio::spawn(ingest.run());

    tokio::select! {
        result = discovery => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "discovery_exited");
            }
        }
        _ = ws => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    Ok(())
}
