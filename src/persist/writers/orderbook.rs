//! Orderbook writers: deltas and snapshots off the bus, plus a periodic task
//! that persists derived snapshot rows from the state store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, error, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::{OrderbookDelta, OrderbookSnapshot, Side};
use crate::state::StateStore;

const CONSUMER_NAME_DELTAS: &str = "ob_writer_delta_1";
const CONSUMER_NAME_SNAPSHOTS: &str = "ob_writer_snap_1";
const DELTA_BATCH_SIZE: usize = 200;
const SNAPSHOT_BATCH_SIZE: usize = 50;

/// Runs the delta consumer, the snapshot consumer, and the periodic
/// state-store snapshot task concurrently.
pub struct OrderbookWriter {
    pool: PgPool,
    state: StateStore,
    snapshot_interval: u64,
}

impl OrderbookWriter {
    pub fn new(pool: PgPool, state: StateStore, snapshot_interval: u64) -> Self {
        Self {
            pool,
            state,
            snapshot_interval,
        }
    }

    pub async fn run(self, consumer: StreamConsumer) -> Result<()> {
        info!("orderbook_writer_started");

        let mut delta_handler = DeltaHandler {
            pool: self.pool.clone(),
        };
        let mut delta_consumer = consumer.clone();
        let deltas = async move {
            delta_consumer
                .consume(
                    topics::ORDERBOOK_DELTAS,
                    CONSUMER_GROUP,
                    CONSUMER_NAME_DELTAS,
                    DELTA_BATCH_SIZE,
                    &mut delta_handler,
                )
                .await
        };

        let mut snap_handler = SnapshotHandler {
            pool: self.pool.clone(),
        };
        let mut snap_consumer = consumer;
        let snapshots = async move {
            snap_consumer
                .consume(
                    topics::ORDERBOOK_SNAPSHOTS,
                    CONSUMER_GROUP,
                    CONSUMER_NAME_SNAPSHOTS,
                    SNAPSHOT_BATCH_SIZE,
                    &mut snap_handler,
                )
                .await
        };

        let periodic = periodic_state_snapshots(
            self.pool.clone(),
            self.state.clone(),
            self.snapshot_interval,
        );

        tokio::try_join!(deltas, snapshots, periodic)?;
        Ok(())
    }
}

struct DeltaHandler {
    pool: PgPool,
}

impl DeltaHandler {
    async fn flush(pool: &PgPool, deltas: &[OrderbookDelta]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for delta in deltas {
            sqlx::query(
                "INSERT INTO orderbook_deltas (ts, market_ticker, price, delta, side, is_own_order)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(delta.timestamp())
            .bind(&delta.market_ticker)
            .bind(delta.price)
            .bind(delta.delta)
            .bind(delta.side.as_str())
            .bind(delta.is_own_order())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for DeltaHandler {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let deltas: Vec<OrderbookDelta> = parse_batch(topics::ORDERBOOK_DELTAS, entries);
        if deltas.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        flush_with_retries("orderbook_deltas", || Self::flush(&pool, &deltas)).await?;
        debug!(count = deltas.len(), "ob_deltas_flushed");
        Ok(())
    }
}

struct SnapshotHandler {
    pool: PgPool,
}

impl SnapshotHandler {
    async fn flush(
        pool: &PgPool,
        snapshots: &[OrderbookSnapshot],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                "INSERT INTO orderbook_snapshots (ts, market_ticker, yes_levels, no_levels,
                     spread, yes_depth_5, no_depth_5)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Utc::now())
            .bind(&snapshot.market_ticker)
            .bind(serde_json::json!(snapshot.yes))
            .bind(serde_json::json!(snapshot.no))
            .bind(snapshot.spread())
            .bind(snapshot.yes_depth_5())
            .bind(snapshot.no_depth_5())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for SnapshotHandler {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let snapshots: Vec<OrderbookSnapshot> = parse_batch(topics::ORDERBOOK_SNAPSHOTS, entries);
        if snapshots.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        flush_with_retries("orderbook_snapshots", || Self::flush(&pool, &snapshots)).await?;
        debug!(count = snapshots.len(), "ob_snapshots_flushed");
        Ok(())
    }
}

/// Every `interval` seconds, persist a derived snapshot row for every book
/// currently held in the state store.
async fn periodic_state_snapshots(pool: PgPool, state: StateStore, interval: u64) -> Result<()> {
    let mut timer = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
    timer.tick().await; // skip the immediate first tick

    loop {
        timer.tick().await;

        let tickers = match state.orderbook_tickers().await {
            Ok(tickers) => tickers,
            Err(e) => {
                error!(error = %e, "orderbook_scan_failed");
                continue;
            }
        };

        let mut written = 0usize;
        for ticker in &tickers {
            let book = match state.current_book(ticker).await {
                Ok(Some(book)) => book,
                Ok(None) => continue,
                Err(e) => {
                    error!(ticker = %ticker, error = %e, "orderbook_read_failed");
                    continue;
                }
            };

            let insert = sqlx::query(
                "INSERT INTO orderbook_snapshots (ts, market_ticker, yes_levels, no_levels,
                     spread, yes_depth_5, no_depth_5)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Utc::now())
            .bind(ticker)
            .bind(serde_json::json!(book.side_levels(Side::Yes)))
            .bind(serde_json::json!(book.side_levels(Side::No)))
            .bind(book.spread())
            .bind(book.yes_depth_5())
            .bind(book.no_depth_5())
            .execute(&pool)
            .await;

            match insert {
                Ok(_) => written += 1,
                Err(e) => error!(ticker = %ticker, error = %e, "periodic_snapshot_insert_failed"),
            }
        }

        info!(markets = tickers.len(), written, "periodic_snapshots_taken");
    }
}
