//! Market discovery and dynamic subscription management.

mod scanner;
mod series;
mod subscriptions;

pub use scanner::{MarketScanner, ScanOutcome};
pub use series::SeriesMapper;
pub use subscriptions::SubscriptionManager;

use std::time::Duration;

use tracing::error;

use crate::error::Result;

/// Drive scan cycles forever: enumerate markets, refresh metadata, rebuild
/// the series graph, and reconcile orderbook subscriptions.
pub async fn run_discovery(
    mut scanner: MarketScanner,
    mut subscriptions: SubscriptionManager,
    mapper: SeriesMapper,
    scan_interval: u64,
) -> Result<()> {
    subscriptions.initialize().await?;

    let mut timer = tokio::time::interval(Duration::from_secs(scan_interval.max(1)));

    loop {
        timer.tick().await;

        match scanner.scan_all_markets().await {
            Ok(outcome) => {
                if let Err(e) = subscriptions.on_markets_discovered(&outcome.new_tickers).await {
                    error!(error = %e, "subscription_add_error");
                }
                if let Err(e) = subscriptions.on_markets_closed(&outcome.closed_tickers).await {
                    error!(error = %e, "subscription_remove_error");
                }
                if let Err(e) = subscriptions.reconcile().await {
                    error!(error = %e, "subscription_reconcile_error");
                }
            }
            Err(e) => error!(error = %e, "market_scan_error"),
        }

        if let Err(e) = scanner.scan_events().await {
            error!(error = %e, "event_scan_error");
        }
        if let Err(e) = scanner.scan_series().await {
            error!(error = %e, "series_scan_error");
        }
        if let Err(e) = mapper.build_market_graph().await {
            error!(error = %e, "market_graph_error");
        }
    }
}
