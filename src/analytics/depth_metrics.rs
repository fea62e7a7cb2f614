//! Order-book snapshot metrics and per-symbol aggregation.
//!
//! A snapshot yields notional depth at the touch, across the top N levels,
//! inside price bands around the mid, and a simulated unwind slippage: the
//! VWAP of selling a fixed quote notional into the bids, best to worst.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::analytics::spread_stats::{median, percentile};
use crate::models::parse_float;

#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshotMetrics {
    pub best_bid_notional: f64,
    pub best_ask_notional: f64,
    pub topn_bid_notional: f64,
    pub topn_ask_notional: f64,
    pub band_bid_notional: BTreeMap<u32, f64>,
    pub band_ask_notional: BTreeMap<u32, f64>,
    /// `None` when the stress notional cannot be filled from the book.
    pub unwind_slippage_bps: Option<f64>,
}

/// Why a snapshot could not be measured; drives the per-symbol error
/// counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    EmptyBook,
    InvalidLevels(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBook => write!(f, "Empty book"),
            Self::InvalidLevels(detail) => write!(f, "Depth level invalid: {detail}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Parse `[price, qty, ...]` arrays of raw values into positive floats.
pub fn parse_levels(levels: &[Vec<Value>]) -> Result<Vec<(f64, f64)>, SnapshotError> {
    let mut parsed = Vec::with_capacity(levels.len());
    for level in levels {
        if level.len() < 2 {
            return Err(SnapshotError::InvalidLevels(
                "level must have price and quantity".to_string(),
            ));
        }
        let price = parse_float(&level[0])
            .ok_or_else(|| SnapshotError::InvalidLevels("price must be numeric".to_string()))?;
        let qty = parse_float(&level[1])
            .ok_or_else(|| SnapshotError::InvalidLevels("quantity must be numeric".to_string()))?;
        if price <= 0.0 || qty <= 0.0 {
            return Err(SnapshotError::InvalidLevels(
                "price and quantity must be positive".to_string(),
            ));
        }
        parsed.push((price, qty));
    }
    Ok(parsed)
}

pub fn compute_snapshot_metrics(
    bids_raw: &[Vec<Value>],
    asks_raw: &[Vec<Value>],
    top_n: usize,
    band_bps: &[u32],
    stress_notional: f64,
) -> Result<DepthSnapshotMetrics, SnapshotError> {
    let bids = parse_levels(bids_raw)?;
    let asks = parse_levels(asks_raw)?;
    if bids.is_empty() || asks.is_empty() {
        return Err(SnapshotError::EmptyBook);
    }

    let (best_bid_price, best_bid_qty) = bids[0];
    let (best_ask_price, best_ask_qty) = asks[0];
    let mid = (best_bid_price + best_ask_price) / 2.0;
    if mid <= 0.0 {
        return Err(SnapshotError::InvalidLevels("mid price must be positive".to_string()));
    }

    let notional_sum = |levels: &[(f64, f64)]| levels.iter().map(|(p, q)| p * q).sum::<f64>();

    let mut band_bid_notional = BTreeMap::new();
    let mut band_ask_notional = BTreeMap::new();
    for band in band_bps {
        let width = *band as f64 / 10_000.0;
        let bid_floor = mid * (1.0 - width);
        let ask_ceiling = mid * (1.0 + width);
        band_bid_notional.insert(
            *band,
            bids.iter()
                .filter(|(price, _)| *price >= bid_floor)
                .map(|(p, q)| p * q)
                .sum(),
        );
        band_ask_notional.insert(
            *band,
            asks.iter()
                .filter(|(price, _)| *price <= ask_ceiling)
                .map(|(p, q)| p * q)
                .sum(),
        );
    }

    Ok(DepthSnapshotMetrics {
        best_bid_notional: best_bid_price * best_bid_qty,
        best_ask_notional: best_ask_price * best_ask_qty,
        topn_bid_notional: notional_sum(&bids[..top_n.min(bids.len())]),
        topn_ask_notional: notional_sum(&asks[..top_n.min(asks.len())]),
        band_bid_notional,
        band_ask_notional,
        unwind_slippage_bps: compute_unwind_slippage_bps(&bids, mid, stress_notional),
    })
}

/// Simulate selling `stress_notional` (quote units) into the bids, best to
/// worst. The last touched level fills partially. `None` when the book
/// cannot absorb the full notional.
pub fn compute_unwind_slippage_bps(
    bids: &[(f64, f64)],
    mid_price: f64,
    stress_notional: f64,
) -> Option<f64> {
    if mid_price <= 0.0 || stress_notional <= 0.0 {
        return None;
    }
    let mut quote_spent = 0.0;
    let mut base_sold = 0.0;
    let mut remaining = stress_notional;

    for (price, qty) in bids {
        let level_notional = price * qty;
        if level_notional >= remaining {
            quote_spent += remaining;
            base_sold += remaining / price;
            remaining = 0.0;
            break;
        }
        quote_spent += level_notional;
        base_sold += qty;
        remaining -= level_notional;
    }

    if remaining > 0.0 || base_sold <= 0.0 {
        return None;
    }

    let vwap = quote_spent / base_sold;
    Some((mid_price - vwap) / mid_price * 10_000.0)
}

/// Medians over the snapshot series; slippage P90 excludes undefined
/// entries. All `None` when there are no snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthAggregates {
    pub best_bid_notional_median: Option<f64>,
    pub best_ask_notional_median: Option<f64>,
    pub topn_bid_notional_median: Option<f64>,
    pub topn_ask_notional_median: Option<f64>,
    pub band_bid_notional_median: BTreeMap<u32, f64>,
    pub band_ask_notional_median: BTreeMap<u32, f64>,
    pub unwind_slippage_p90_bps: Option<f64>,
}

pub fn aggregate_depth_metrics(
    snapshots: &[DepthSnapshotMetrics],
    band_bps: &[u32],
) -> DepthAggregates {
    if snapshots.is_empty() {
        return DepthAggregates::default();
    }

    let sorted_median = |mut values: Vec<f64>| -> Option<f64> {
        values.sort_by(|a, b| a.partial_cmp(b).expect("notionals are finite"));
        median(&values)
    };

    let mut band_bid_notional_median = BTreeMap::new();
    let mut band_ask_notional_median = BTreeMap::new();
    for band in band_bps {
        let bid_values: Vec<f64> = snapshots
            .iter()
            .map(|s| s.band_bid_notional.get(band).copied().unwrap_or(0.0))
            .collect();
        let ask_values: Vec<f64> = snapshots
            .iter()
            .map(|s| s.band_ask_notional.get(band).copied().unwrap_or(0.0))
            .collect();
        if let Some(value) = sorted_median(bid_values) {
            band_bid_notional_median.insert(*band, value);
        }
        if let Some(value) = sorted_median(ask_values) {
            band_ask_notional_median.insert(*band, value);
        }
    }

    let mut slippage: Vec<f64> = snapshots
        .iter()
        .filter_map(|s| s.unwind_slippage_bps)
        .collect();
    slippage.sort_by(|a, b| a.partial_cmp(b).expect("slippage bps are finite"));

    DepthAggregates {
        best_bid_notional_median: sorted_median(snapshots.iter().map(|s| s.best_bid_notional).collect()),
        best_ask_notional_median: sorted_median(snapshots.iter().map(|s| s.best_ask_notional).collect()),
        topn_bid_notional_median: sorted_median(snapshots.iter().map(|s| s.topn_bid_notional).collect()),
        topn_ask_notional_median: sorted_median(snapshots.iter().map(|s| s.topn_ask_notional).collect()),
        band_bid_notional_median,
        band_ask_notional_median,
        unwind_slippage_p90_bps: percentile(&slippage, 0.90),
    }
}
