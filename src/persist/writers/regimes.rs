//! Regime writer: `kalshi:signals:regime` -> `regime_log` table.
//!
//! Regime transitions travel as `regime_change` signals whose metadata
//! carries the old/new regime and the classification features.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{CONSUMER_GROUP, flush_with_retries, parse_batch};
use crate::bus::{StreamConsumer, StreamEntry, StreamHandler, topics};
use crate::error::Result;
use crate::models::Signal;

const CONSUMER_NAME: &str = "regime_writer_1";
const BATCH_SIZE: usize = 50;

/// Fields extracted from a `regime_change` signal's metadata.
#[derive(Debug, PartialEq)]
pub(crate) struct RegimeRow {
    pub old_regime: Option<String>,
    pub new_regime: String,
    pub trade_rate: Option<f64>,
    pub message_rate: Option<f64>,
    pub depth_imbalance: Option<f64>,
}

pub(crate) fn regime_row(signal: &Signal) -> RegimeRow {
    let meta = &signal.metadata;
    RegimeRow {
        old_regime: meta
            .get("old_regime")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        new_regime: meta
            .get("new_regime")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        trade_rate: meta.get("trade_rate").and_then(|v| v.as_f64()),
        message_rate: meta.get("message_rate").and_then(|v| v.as_f64()),
        depth_imbalance: meta.get("depth_imbalance").and_then(|v| v.as_f64()),
    }
}

pub struct RegimeWriter {
    pool: PgPool,
    total_written: u64,
}

impl RegimeWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            total_written: 0,
        }
    }

    pub async fn run(mut self, mut consumer: StreamConsumer) -> Result<()> {
        info!("regime_writer_started");
        consumer
            .consume(topics::SIGNALS_REGIME, CONSUMER_GROUP, CONSUMER_NAME, BATCH_SIZE, &mut self)
            .await
    }

    async fn flush(pool: &PgPool, signals: &[Signal]) -> std::result::Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for signal in signals {
            let row = regime_row(signal);
            sqlx::query(
                "INSERT INTO regime_log (ts, market_ticker, old_regime, new_regime,
                     trade_rate, message_rate, depth_imbalance)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(signal.ts)
            .bind(&signal.market_ticker)
            .bind(row.old_regime)
            .bind(row.new_regime)
            .bind(row.trade_rate)
            .bind(row.message_rate)
            .bind(row.depth_imbalance)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl StreamHandler for RegimeWriter {
    async fn handle(&mut self, entries: &[StreamEntry]) -> Result<()> {
        let signals: Vec<Signal> = parse_batch(topics::SIGNALS_REGIME, entries);
        if signals.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        flush_with_retries("regimes", || Self::flush(&pool, &signals)).await?;

        self.total_written += signals.len() as u64;
        debug!(count = signals.len(), total = self.total_written, "regimes_flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalDirection, SignalUrgency};

    #[test]
    fn test_regime_row_extraction() {
        let signal = Signal::new(
            "regime_change",
            "M1",
            SignalDirection::Neutral,
            0.5,
            0.8,
            SignalUrgency::Background,
        )
        .with_metadata(serde_json::json!({
            "old_regime": "quiet",
            "new_regime": "active",
            "trade_rate": 3.4,
            "message_rate": 0.9,
            "depth_imbalance": -0.12
        }));

        let row = regime_row(&signal);
        assert_eq!(row.old_regime.as_deref(), Some("quiet"));
        assert_eq!(row.new_regime, "active");
        assert_eq!(row.trade_rate, Some(3.4));
        assert_eq!(row.depth_imbalance, Some(-0.12));
    }

    #[test]
    fn test_regime_row_missing_metadata() {
        let signal = Signal::new(
            "regime_change",
            "M1",
            SignalDirection::Neutral,
            0.5,
            0.8,
            SignalUrgency::Background,
        );
        let row = regime_row(&signal);
        assert_eq!(row.old_regime, None);
        assert_eq!(row.new_regime, "unknown");
    }
}
