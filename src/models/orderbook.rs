//! Orderbook snapshots, deltas, and the reconstructed per-market book.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Side;

/// A price level: `[price_cents, contracts]`.
pub type PriceLevel = [i64; 2];

/// Full orderbook state from the `orderbook_snapshot` channel.
///
/// Either side may be omitted when empty; a snapshot replaces any previous
/// book for the market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: Vec<PriceLevel>,
    #[serde(default)]
    pub no: Vec<PriceLevel>,
}

impl OrderbookSnapshot {
    /// Total quantity in the top 5 yes levels (by price, descending).
    pub fn yes_depth_5(&self) -> i64 {
        depth_5(&self.yes)
    }

    /// Total quantity in the top 5 no levels (by price, descending).
    pub fn no_depth_5(&self) -> i64 {
        depth_5(&self.no)
    }

    /// Spread in binary-market terms: `100 - best_yes_bid - best_no_bid`.
    pub fn spread(&self) -> Option<i64> {
        let best_yes = self.yes.iter().map(|l| l[0]).max()?;
        let best_no = self.no.iter().map(|l| l[0]).max()?;
        Some(100 - best_yes - best_no)
    }
}

fn depth_5(levels: &[PriceLevel]) -> i64 {
    let mut sorted: Vec<&PriceLevel> = levels.iter().collect();
    sorted.sort_by_key(|l| std::cmp::Reverse(l[0]));
    sorted.iter().take(5).map(|l| l[1]).sum()
}

/// A single change from the `orderbook_delta` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookDelta {
    pub market_ticker: String,
    /// Price level being updated (0-99 cents).
    pub price: i64,
    /// Signed change in quantity.
    pub delta: i64,
    pub side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    /// Present when the subscriber's own order caused the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderbookDelta {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts.unwrap_or_else(Utc::now)
    }

    pub fn is_own_order(&self) -> bool {
        self.client_order_id.is_some()
    }
}

/// The reconstructed book for one market, maintained from snapshot + deltas.
///
/// Stored in the state store as JSON with `price -> quantity` maps per side.
/// `BTreeMap` keeps best-price queries O(log n), and serde_json renders the
/// integer keys as the string keys the stored payload uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderbookState {
    pub market_ticker: String,
    #[serde(default)]
    pub yes: BTreeMap<i64, i64>,
    #[serde(default)]
    pub no: BTreeMap<i64, i64>,
}

impl OrderbookState {
    /// Build a fresh book from a snapshot, dropping empty levels.
    pub fn from_snapshot(snapshot: &OrderbookSnapshot) -> Self {
        Self {
            market_ticker: snapshot.market_ticker.clone(),
            yes: levels_to_map(&snapshot.yes),
            no: levels_to_map(&snapshot.no),
        }
    }

    /// Apply a delta, returning the new quantity at the touched level.
    ///
    /// A delta against a missing price yields `max(delta, 0)`; any level at
    /// or below zero quantity is removed.
    pub fn apply_delta(&mut self, delta: &OrderbookDelta) -> i64 {
        let levels = match delta.side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        };

        let current = levels.get(&delta.price).copied().unwrap_or(0);
        let new_qty = current + delta.delta;

        if new_qty <= 0 {
            levels.remove(&delta.price);
            0
        } else {
            levels.insert(delta.price, new_qty);
            new_qty
        }
    }

    /// Highest yes price with resting quantity.
    pub fn best_yes_bid(&self) -> Option<i64> {
        self.yes.keys().next_back().copied()
    }

    /// Highest no price with resting quantity.
    pub fn best_no_bid(&self) -> Option<i64> {
        self.no.keys().next_back().copied()
    }

    /// `100 - best_yes_bid - best_no_bid`. Negative when the books cross.
    pub fn spread(&self) -> Option<i64> {
        Some(100 - self.best_yes_bid()? - self.best_no_bid()?)
    }

    /// `(best_yes_bid + (100 - best_no_bid)) / 2`.
    pub fn midpoint(&self) -> Option<f64> {
        let bid = self.best_yes_bid()? as f64;
        let ask = 100.0 - self.best_no_bid()? as f64;
        Some((bid + ask) / 2.0)
    }

    pub fn yes_depth_5(&self) -> i64 {
        self.yes.values().rev().take(5).sum()
    }

    pub fn no_depth_5(&self) -> i64 {
        self.no.values().rev().take(5).sum()
    }

    /// Side levels as `[price, qty]` pairs for persistence.
    pub fn side_levels(&self, side: Side) -> Vec<PriceLevel> {
        let levels = match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        };
        levels.iter().map(|(&p, &q)| [p, q]).collect()
    }
}

fn levels_to_map(levels: &[PriceLevel]) -> BTreeMap<i64, i64> {
    levels
        .iter()
        .filter(|[_, qty]| *qty > 0)
        .map(|[price, qty]| (*price, *qty))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> OrderbookSnapshot {
        OrderbookSnapshot {
            market_ticker: "TEST".to_string(),
            yes: vec![[36, 100], [35, 200]],
            no: vec![[64, 80], [65, 120]],
        }
    }

    fn delta(price: i64, qty: i64, side: Side) -> OrderbookDelta {
        OrderbookDelta {
            market_ticker: "TEST".to_string(),
            price,
            delta: qty,
            side,
            ts: None,
            client_order_id: None,
        }
    }

    #[test]
    fn test_from_snapshot() {
        let state = OrderbookState::from_snapshot(&snapshot());
        assert_eq!(state.yes.get(&36), Some(&100));
        assert_eq!(state.yes.get(&35), Some(&200));
        assert_eq!(state.no.get(&64), Some(&80));
        assert_eq!(state.no.get(&65), Some(&120));
    }

    #[test]
    fn test_snapshot_drops_empty_levels() {
        let snap = OrderbookSnapshot {
            market_ticker: "TEST".to_string(),
            yes: vec![[45, 0], [44, 10]],
            no: vec![],
        };
        let state = OrderbookState::from_snapshot(&snap);
        assert!(!state.yes.contains_key(&45));
        assert_eq!(state.yes.get(&44), Some(&10));
    }

    #[test]
    fn test_reconstruction_scenario() {
        // snapshot -> three deltas, checked against the expected final book.
        let mut state = OrderbookState::from_snapshot(&snapshot());
        state.apply_delta(&delta(36, -20, Side::Yes));
        state.apply_delta(&delta(33, 50, Side::Yes));
        state.apply_delta(&delta(64, -80, Side::No));

        let expected_yes: Vec<(i64, i64)> = vec![(33, 50), (35, 200), (36, 80)];
        assert_eq!(
            state.yes.iter().map(|(&p, &q)| (p, q)).collect::<Vec<_>>(),
            expected_yes
        );
        let expected_no: Vec<(i64, i64)> = vec![(65, 120)];
        assert_eq!(
            state.no.iter().map(|(&p, &q)| (p, q)).collect::<Vec<_>>(),
            expected_no
        );

        assert_eq!(state.spread(), Some(-1));
        assert_eq!(state.midpoint(), Some(35.5));
    }

    #[test]
    fn test_delta_on_missing_price() {
        let mut state = OrderbookState::default();
        assert_eq!(state.apply_delta(&delta(45, 100, Side::Yes)), 100);
        // Negative delta on a missing price leaves the level absent.
        assert_eq!(state.apply_delta(&delta(50, -30, Side::Yes)), 0);
        assert!(!state.yes.contains_key(&50));
    }

    #[test]
    fn test_delta_removes_level_at_zero_or_below() {
        let mut state = OrderbookState::default();
        state.apply_delta(&delta(45, 50, Side::No));
        assert_eq!(state.apply_delta(&delta(45, -50, Side::No)), 0);
        assert!(!state.no.contains_key(&45));

        state.apply_delta(&delta(45, 50, Side::No));
        assert_eq!(state.apply_delta(&delta(45, -100, Side::No)), 0);
        assert!(!state.no.contains_key(&45));
    }

    #[test]
    fn test_book_round_trip() {
        let mut state = OrderbookState::from_snapshot(&snapshot());
        state.apply_delta(&delta(33, 50, Side::Yes));

        let encoded = serde_json::to_string(&state).unwrap();
        let restored: OrderbookState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, restored);

        // Empty sides survive the round trip too.
        let empty = OrderbookState {
            market_ticker: "EMPTY".to_string(),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&empty).unwrap();
        let restored: OrderbookState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(empty, restored);
    }

    #[test]
    fn test_empty_book_derived_values() {
        let state = OrderbookState::default();
        assert_eq!(state.best_yes_bid(), None);
        assert_eq!(state.spread(), None);
        assert_eq!(state.midpoint(), None);
        assert_eq!(state.yes_depth_5(), 0);
    }

    #[test]
    fn test_depth_5_takes_top_levels() {
        let snap = OrderbookSnapshot {
            market_ticker: "TEST".to_string(),
            yes: vec![[40, 1], [41, 2], [42, 3], [43, 4], [44, 5], [45, 6], [46, 7]],
            no: vec![],
        };
        // Top 5 by price: 46,45,44,43,42 -> 7+6+5+4+3.
        assert_eq!(snap.yes_depth_5(), 25);
        let state = OrderbookState::from_snapshot(&snap);
        assert_eq!(state.yes_depth_5(), 25);
    }

    #[test]
    fn test_snapshot_spread() {
        assert_eq!(snapshot().spread(), Some(100 - 36 - 65));
        let one_sided = OrderbookSnapshot {
            market_ticker: "TEST".to_string(),
            yes: vec![[45, 10]],
            no: vec![],
        };
        assert_eq!(one_sided.spread(), None);
    }

    #[test]
    fn test_delta_is_own_order() {
        let mut d = delta(45, 5, Side::Yes);
        assert!(!d.is_own_order());
        d.client_order_id = Some("abc".to_string());
        assert!(d.is_own_order());
    }
}
