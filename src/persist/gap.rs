//! Data-continuity checks over the persisted record.
//!
//! Runs a `LEAD` window query per market and reports spans where the
//! inter-record delta exceeds a threshold.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::Result;

/// Maximum tolerated silence between consecutive trades.
pub const TRADE_GAP_SECONDS: i64 = 300;

/// Maximum tolerated silence between consecutive ticker updates.
pub const TICKER_GAP_SECONDS: i64 = 600;

/// A detected gap: `(last record before, first record after)`.
pub type Gap = (DateTime<Utc>, DateTime<Utc>);

/// Filter `(ts, next_ts)` pairs down to the spans exceeding `max_gap_seconds`.
pub(crate) fn gaps_from_rows(
    rows: &[(DateTime<Utc>, Option<DateTime<Utc>>)],
    max_gap_seconds: i64,
) -> Vec<Gap> {
    rows.iter()
        .filter_map(|(ts, next_ts)| {
            let next_ts = (*next_ts)?;
            ((next_ts - *ts).num_seconds() > max_gap_seconds).then_some((*ts, next_ts))
        })
        .collect()
}

pub struct GapDetector {
    pool: PgPool,
}

impl GapDetector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn continuity(
        &self,
        table: &str,
        market_ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_gap_seconds: i64,
    ) -> Result<Vec<Gap>> {
        let query = format!(
            "SELECT ts, LEAD(ts) OVER (ORDER BY ts) AS next_ts
             FROM {table}
             WHERE market_ticker = $1 AND ts BETWEEN $2 AND $3
             ORDER BY ts"
        );

        let rows = sqlx::query(&query)
            .bind(market_ticker)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        let pairs: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = rows
            .iter()
            .map(|row| (row.get("ts"), row.get("next_ts")))
            .collect();

        Ok(gaps_from_rows(&pairs, max_gap_seconds))
    }

    /// Gaps longer than [`TRADE_GAP_SECONDS`] in a market's trade record.
    pub async fn check_trade_continuity(
        &self,
        market_ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Gap>> {
        let gaps = self
            .continuity("trades", market_ticker, start, end, TRADE_GAP_SECONDS)
            .await?;
        if !gaps.is_empty() {
            warn!(
                market_ticker,
                gap_count = gaps.len(),
                total_gap_seconds = gaps
                    .iter()
                    .map(|(s, e)| (*e - *s).num_seconds())
                    .sum::<i64>(),
                "trade_gaps_detected"
            );
        }
        Ok(gaps)
    }

    /// Gaps longer than [`TICKER_GAP_SECONDS`] in a market's ticker record.
    pub async fn check_ticker_continuity(
        &self,
        market_ticker: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Gap>> {
        let gaps = self
            .continuity("ticker_updates", market_ticker, start, end, TICKER_GAP_SECONDS)
            .await?;
        if !gaps.is_empty() {
            warn!(market_ticker, gap_count = gaps.len(), "ticker_gaps_detected");
        }
        Ok(gaps)
    }

    /// Run trade-gap detection across every open market over a lookback window.
    pub async fn check_all_active_markets(
        &self,
        lookback_hours: i64,
    ) -> Result<Vec<(String, Vec<Gap>)>> {
        let now = Utc::now();
        let start = now - Duration::hours(lookback_hours);

        let tickers: Vec<String> =
            sqlx::query_scalar("SELECT ticker FROM markets WHERE status = 'open'")
                .fetch_all(&self.pool)
                .await?;

        let mut results = Vec::new();
        for ticker in &tickers {
            let gaps = self.check_trade_continuity(ticker, start, now).await?;
            if !gaps.is_empty() {
                results.push((ticker.clone(), gaps));
            }
        }

        info!(
            markets_checked = tickers.len(),
            markets_with_gaps = results.len(),
            "gap_check_complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_gaps_from_rows() {
        let rows = vec![
            (ts(0), Some(ts(60))),      // 60 s, fine
            (ts(60), Some(ts(500))),    // 440 s, gap
            (ts(500), Some(ts(700))),   // 200 s, fine
            (ts(700), Some(ts(1_100))), // 400 s, gap
            (ts(1_100), None),          // tail row, ignored
        ];
        let gaps = gaps_from_rows(&rows, TRADE_GAP_SECONDS);
        assert_eq!(gaps, vec![(ts(60), ts(500)), (ts(700), ts(1_100))]);
    }

    #[test]
    fn test_gaps_exactly_at_threshold_are_not_gaps() {
        let rows = vec![(ts(0), Some(ts(300)))];
        assert!(gaps_from_rows(&rows, TRADE_GAP_SECONDS).is_empty());
    }

    #[test]
    fn test_empty_rows() {
        assert!(gaps_from_rows(&[], TRADE_GAP_SECONDS).is_empty());
    }
}
