//! Per-symbol spread statistics.

use serde::{Deserialize, Serialize};

use crate::models::spread::{compute_spread_bps, SpreadSample};

/// Below this many valid samples a symbol is flagged `insufficient_samples`.
pub const MIN_SAMPLE_COUNT: usize = 3;

/// Linear-interpolation percentile over a pre-sorted slice.
///
/// `None` for an empty slice or a quantile outside `[0, 1]`; a single
/// element is its own percentile at every quantile.
pub fn percentile(sorted_values: &[f64], q: f64) -> Option<f64> {
    if sorted_values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    if sorted_values.len() == 1 {
        return Some(sorted_values[0]);
    }
    let position = q * (sorted_values.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return Some(sorted_values[lower]);
    }
    let weight = position - lower as f64;
    Some(sorted_values[lower] + (sorted_values[upper] - sorted_values[lower]) * weight)
}

pub fn median(sorted_values: &[f64]) -> Option<f64> {
    percentile(sorted_values, 0.5)
}

/// Aggregated spread observations for one symbol, including the 24h
/// enrichment joined in by the score stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadStats {
    pub symbol: String,
    pub sample_count: usize,
    pub valid_samples: usize,
    pub invalid_quotes: usize,
    pub spread_median_bps: Option<f64>,
    pub spread_p10_bps: Option<f64>,
    pub spread_p25_bps: Option<f64>,
    pub spread_p90_bps: Option<f64>,
    /// `valid_samples / sample_count`, 0 when there are no samples.
    pub uptime: f64,
    pub insufficient_samples: bool,
    pub quote_volume_24h_raw: Option<f64>,
    pub volume_24h_raw: Option<f64>,
    pub mid_price: Option<f64>,
    pub quote_volume_24h_est: Option<f64>,
    pub quote_volume_24h_effective: Option<f64>,
    pub trades_24h: Option<i64>,
    pub missing_24h_stats: bool,
    pub missing_24h_reason: Option<String>,
}

impl SpreadStats {
    /// Stats for a symbol that produced no raw samples at all.
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            insufficient_samples: true,
            ..Self::default()
        }
    }
}

/// Fold raw samples into per-symbol statistics. Samples whose quotes are
/// invalid (crossed, non-positive) count toward `invalid_quotes` and are
/// excluded from the percentiles.
pub fn compute_spread_stats(symbol: &str, samples: &[SpreadSample]) -> SpreadStats {
    if samples.is_empty() {
        return SpreadStats::empty(symbol);
    }

    let mut spreads: Vec<f64> = Vec::with_capacity(samples.len());
    let mut invalid_quotes = 0usize;
    for sample in samples {
        match compute_spread_bps(sample.bid, sample.ask) {
            Some(bps) => spreads.push(bps),
            None => invalid_quotes += 1,
        }
    }

    let sample_count = samples.len();
    let valid_samples = spreads.len();
    let uptime = valid_samples as f64 / sample_count as f64;
    let insufficient_samples = valid_samples < MIN_SAMPLE_COUNT;

    spreads.sort_by(|a, b| a.partial_cmp(b).expect("spread bps are finite"));

    SpreadStats {
        symbol: symbol.to_string(),
        sample_count,
        valid_samples,
        invalid_quotes,
        spread_median_bps: median(&spreads),
        spread_p10_bps: percentile(&spreads, 0.10),
        spread_p25_bps: percentile(&spreads, 0.25),
        spread_p90_bps: percentile(&spreads, 0.90),
        uptime,
        insufficient_samples,
        ..SpreadStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bid: f64, ask: f64) -> SpreadSample {
        SpreadSample {
            symbol: "AAAUSDT".to_string(),
            bid,
            ask,
        }
    }

    #[test]
    fn test_percentile_interpolation() {
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&values, 0.5), Some(30.0));
        assert_eq!(percentile(&values, 0.10), Some(14.0));
        assert_eq!(percentile(&values, 0.25), Some(20.0));
        assert_eq!(percentile(&values, 0.90), Some(46.0));
        assert_eq!(percentile(&values, 0.0), Some(10.0));
        assert_eq!(percentile(&values, 1.0), Some(50.0));
    }

    #[test]
    fn test_percentile_degenerate_cases() {
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[42.0], 0.1), Some(42.0));
        assert_eq!(percentile(&[1.0, 2.0], 1.5), None);
    }

    #[test]
    fn test_stats_counts_invalid_quotes() {
        let samples = vec![
            sample(100.0, 101.0),
            sample(100.0, 100.5),
            sample(101.0, 100.0), // crossed
            sample(0.0, 1.0),     // non-positive bid
        ];
        let stats = compute_spread_stats("AAAUSDT", &samples);
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.valid_samples, 2);
        assert_eq!(stats.invalid_quotes, 2);
        assert!((stats.uptime - 0.5).abs() < 1e-12);
        assert!(stats.insufficient_samples);
        assert!(stats.spread_median_bps.is_some());
    }

    #[test]
    fn test_percentile_ordering_invariant() {
        let samples: Vec<SpreadSample> = (0..20)
            .map(|i| sample(100.0, 100.0 + 0.05 * (i + 1) as f64))
            .collect();
        let stats = compute_spread_stats("AAAUSDT", &samples);
        let p10 = stats.spread_p10_bps.unwrap();
        let p25 = stats.spread_p25_bps.unwrap();
        let p50 = stats.spread_median_bps.unwrap();
        let p90 = stats.spread_p90_bps.unwrap();
        assert!(p10 <= p25 && p25 <= p50 && p50 <= p90);
        assert!(!stats.insufficient_samples);
    }

    #[test]
    fn test_empty_stats_shape() {
        let stats = SpreadStats::empty("AAAUSDT");
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.uptime, 0.0);
        assert!(stats.insufficient_samples);
        assert_eq!(stats.spread_median_bps, None);
    }
}
