//! Spread sampling primitives.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One best bid/ask observation for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadSample {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
}

/// Quoted spread in basis points relative to the midprice.
///
/// A quote is invalid (returns `None`) when either side is non-positive,
/// the book is crossed or locked (`bid >= ask`), or the midprice is
/// non-positive.
pub fn compute_spread_bps(bid: f64, ask: f64) -> Option<f64> {
    if bid <= 0.0 || ask <= 0.0 || bid >= ask {
        return None;
    }
    let mid = (bid + ask) / 2.0;
    if mid <= 0.0 {
        return None;
    }
    Some((ask - bid) / mid * 10_000.0)
}

/// Outcome of the spread sampling stage.
#[derive(Debug, Clone, Serialize)]
pub struct SpreadSamplingResult {
    pub target_ticks: u64,
    pub ticks_success: u64,
    pub ticks_fail: u64,
    pub invalid_quotes: u64,
    pub missing_quotes: u64,
    pub uptime: f64,
    pub low_quality: bool,
    pub timed_out: bool,
    pub elapsed_s: f64,
    pub raw_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_bps_basic() {
        let bps = compute_spread_bps(100.0, 101.0).unwrap();
        // (1 / 100.5) * 10_000
        assert!((bps - 99.502487).abs() < 1e-4);
    }

    #[test]
    fn test_spread_bps_rejects_bad_quotes() {
        assert_eq!(compute_spread_bps(0.0, 1.0), None);
        assert_eq!(compute_spread_bps(1.0, 0.0), None);
        assert_eq!(compute_spread_bps(1.0, 1.0), None);
        assert_eq!(compute_spread_bps(2.0, 1.0), None);
        assert_eq!(compute_spread_bps(-5.0, -1.0), None);
    }
}
