//! Backfill process: detect gaps in the persisted trade record and fill them
//! from the REST API, then exit.

use tracing::info;
use tracing_subscriber::EnvFilter;

use kalshi_alpha_rs::auth::AuthSigner;
use kalshi_alpha_rs::config::AppConfig;
use kalshi_alpha_rs::persist::{self, Backfiller, GapDetector};
use kalshi_alpha_rs::rest::RestClient;

const LOOKBACK_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> kalshi_alpha_rs::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    let signer = AuthSigner::from_pem_file(&config.kalshi.api_key_id, &config.kalshi.private_key_path)?;

    let pool = persist::connect_pool(&config.postgres).await?;
    persist::ensure_schema(&pool).await?;

    let detector = GapDetector::new(pool.clone());
    let gaps = detector.check_all_active_markets(LOOKBACK_HOURS).await?;

    if gaps.is_empty() {
        info!("no_gaps_detected");
        return Ok(());
    }

    let rest = RestClient::new(signer, config.kalshi.api_base_url.clone())?;
    let backfiller = Backfiller::new(rest, pool);
    let results = backfiller.backfill_gaps(&gaps).await?;

    for (ticker, records) in &results {
        info!(ticker = %ticker, records = *records, "market_backfilled");
    }
    Ok(())
}
