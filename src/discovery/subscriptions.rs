//! Dynamic WebSocket subscription management.
//!
//! Broadcast channels (`ticker_v2`, `trade`, `market_lifecycle_v2`,
//! `event_lifecycle`) are subscribed once without filters; `orderbook_delta`
//! subscriptions are added and removed per market as activity changes.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;
use crate::ingest::IngestHandle;

pub struct SubscriptionManager {
    ws: IngestHandle,
    pool: PgPool,
    orderbook_sid: Option<u64>,
    active_ob_tickers: HashSet<String>,
}

impl SubscriptionManager {
    pub fn new(ws: IngestHandle, pool: PgPool) -> Self {
        Self {
            ws,
            pool,
            orderbook_sid: None,
            active_ob_tickers: HashSet::new(),
        }
    }

    /// Set up the unfiltered broadcast subscriptions.
    pub async fn initialize(&self) -> Result<()> {
        self.ws.subscribe(vec!["ticker_v2".to_string()], None).await?;
        self.ws.subscribe(vec!["trade".to_string()], None).await?;
        self.ws
            .subscribe(vec!["market_lifecycle_v2".to_string()], None)
            .await?;
        self.ws
            .subscribe(vec!["event_lifecycle".to_string()], None)
            .await?;
        info!("broadcast_subscriptions_initialized");
        Ok(())
    }

    /// Newly discovered markets: add orderbook subscriptions for the active ones.
    pub async fn on_markets_discovered(&mut self, new_markets: &[String]) -> Result<()> {
        let active = self.filter_active(new_markets).await?;
        if active.is_empty() {
            return Ok(());
        }

        match self.orderbook_sid {
            None => {
                let sid = self
                    .ws
                    .subscribe(vec!["orderbook_delta".to_string()], Some(active.clone()))
                    .await?;
                self.orderbook_sid = Some(sid);
            }
            Some(sid) => {
                self.ws
                    .update_subscription(sid, active.clone(), Vec::new())
                    .await?;
            }
        }

        self.active_ob_tickers.extend(active.iter().cloned());
        info!(count = active.len(), "orderbook_subscriptions_added");
        Ok(())
    }

    /// Closed or settled markets: drop their orderbook subscriptions.
    pub async fn on_markets_closed(&mut self, closed_markets: &[String]) -> Result<()> {
        let to_remove: Vec<String> = closed_markets
            .iter()
            .filter(|t| self.active_ob_tickers.contains(*t))
            .cloned()
            .collect();

        let Some(sid) = self.orderbook_sid else {
            return Ok(());
        };
        if to_remove.is_empty() {
            return Ok(());
        }

        self.ws
            .update_subscription(sid, Vec::new(), to_remove.clone())
            .await?;
        for ticker in &to_remove {
            self.active_ob_tickers.remove(ticker);
        }
        info!(count = to_remove.len(), "orderbook_subscriptions_removed");
        Ok(())
    }

    /// Reconcile the subscription set with the desired state from the DB.
    pub async fn reconcile(&mut self) -> Result<()> {
        let desired: HashSet<String> = self
            .desired_orderbook_tickers()
            .await?
            .into_iter()
            .collect();

        let to_add: Vec<String> = desired
            .difference(&self.active_ob_tickers)
            .cloned()
            .collect();
        let to_remove: Vec<String> = self
            .active_ob_tickers
            .difference(&desired)
            .cloned()
            .collect();

        if !to_add.is_empty() {
            self.on_markets_discovered(&to_add).await?;
        }
        if !to_remove.is_empty() {
            self.on_markets_closed(&to_remove).await?;
        }

        if !to_add.is_empty() || !to_remove.is_empty() {
            info!(
                added = to_add.len(),
                removed = to_remove.len(),
                total = self.active_ob_tickers.len(),
                "subscriptions_reconciled"
            );
        }
        Ok(())
    }

    /// Markets that warrant an orderbook subscription: open, with recent
    /// volume or an imminent close.
    async fn desired_orderbook_tickers(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT m.ticker
             FROM markets m
             WHERE m.status = 'open'
               AND (
                 EXISTS (
                     SELECT 1 FROM trades t
                     WHERE t.market_ticker = m.ticker
                       AND t.ts > now() - INTERVAL '24 hours'
                 )
                 OR (m.close_time IS NOT NULL AND m.close_time < now() + INTERVAL '48 hours')
               )",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn filter_active(&self, tickers: &[String]) -> Result<Vec<String>> {
        if tickers.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT ticker FROM markets
             WHERE ticker = ANY($1)
               AND status = 'open'
               AND (close_time IS NULL OR close_time > now())",
        )
        .bind(tickers)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
