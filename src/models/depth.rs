//! Depth stage result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-symbol aggregation of order-book snapshots plus the liquidity
/// verdict. Band medians are keyed by band width in bps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSymbolMetrics {
    pub symbol: String,
    pub sample_count: u64,
    pub valid_samples: u64,
    pub empty_book_count: u64,
    pub invalid_book_count: u64,
    pub symbol_unavailable_count: u64,
    pub best_bid_notional_median: Option<f64>,
    pub best_ask_notional_median: Option<f64>,
    pub topn_bid_notional_median: Option<f64>,
    pub topn_ask_notional_median: Option<f64>,
    pub band_bid_notional_median: BTreeMap<u32, f64>,
    pub band_ask_notional_median: BTreeMap<u32, f64>,
    pub unwind_slippage_p90_bps: Option<f64>,
    /// Informational only; never a pass criterion.
    pub uptime: f64,
    pub best_bid_notional_pass: bool,
    pub best_ask_notional_pass: bool,
    pub unwind_slippage_pass: bool,
    /// `None` when the band check is disabled.
    pub band_10bps_notional_pass: Option<bool>,
    /// `None` when the top-N check is disabled.
    pub topn_notional_pass: Option<bool>,
    pub pass_depth: bool,
    pub fail_reasons: Vec<String>,
}

/// Outcome of the depth sampling stage.
#[derive(Debug, Clone, Serialize)]
pub struct DepthCheckResult {
    pub target_ticks: u64,
    pub ticks_success: u64,
    pub ticks_fail: u64,
    pub symbols: Vec<DepthSymbolMetrics>,
    pub depth_requests_total: u64,
    pub depth_fail_total: u64,
    pub depth_symbols_pass_total: u64,
    pub timed_out: bool,
    pub elapsed_s: f64,
}
