//! Topic consumers that batch-insert into the time-series database.
//!
//! One consumer per topic, all in the `db_writers` group. Inserts retry up to
//! three times with exponential backoff; a batch that still fails is returned
//! as an error so the bus leaves it in the PEL for redelivery. Parse failures
//! are logged and skipped to avoid poison-pill loops.

mod composites;
mod lifecycle;
mod orderbook;
mod regimes;
mod signals;
mod tickers;
mod trades;

pub use composites::CompositeWriter;
pub use lifecycle::LifecycleWriter;
pub use orderbook::OrderbookWriter;
pub use regimes::RegimeWriter;
pub use signals::SignalWriter;
pub use tickers::TickerWriter;
pub use trades::TradeWriter;

use std::future::Future;

use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::bus::StreamEntry;
use crate::error::{Error, Result};
use crate::persist::db::{WRITE_RETRIES, backoff_delay};

/// Consumer group shared by all database writers.
pub const CONSUMER_GROUP: &str = "db_writers";

/// Parse a batch of entries, logging and skipping anything malformed.
pub(crate) fn parse_batch<T: DeserializeOwned>(topic: &str, entries: &[StreamEntry]) -> Vec<T> {
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_str::<T>(&entry.data) {
            Ok(value) => parsed.push(value),
            Err(e) => warn!(topic, id = %entry.id, error = %e, "parse_skip"),
        }
    }
    parsed
}

/// Run an insert closure with the writers' bounded retry policy.
pub(crate) async fn flush_with_retries<F, Fut>(op: &'static str, mut flush: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match flush().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= WRITE_RETRIES {
                    error!(op, error = %e, "flush_failed_permanently");
                    return Err(Error::PersistenceExhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                warn!(op, error = %e, retry = attempt, "flush_error");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }
    }
}
