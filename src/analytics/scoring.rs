//! Fee-adjusted edge and the pass/fail verdict per symbol.
//!
//! Edge formulas (all bps, `None` when the underlying percentile is
//! missing):
//!
//! ```text
//! edge_mm     = spread_median - 2*maker_fee - buffer
//! edge_mm_p25 = spread_p25    - 2*maker_fee - buffer
//! edge_mt     = spread_median - (maker_fee + taker_fee) - buffer
//! net_edge    = edge_mm
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::analytics::spread_stats::SpreadStats;
use crate::config::AppConfig;
use crate::obs::EventLogger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub symbol: String,
    pub spread_stats: SpreadStats,
    pub edge_mm_bps: Option<f64>,
    pub edge_mm_p25_bps: Option<f64>,
    pub edge_mt_bps: Option<f64>,
    pub net_edge_bps: Option<f64>,
    pub pass_spread: bool,
    pub score: f64,
    /// Ordered, unique; empty iff `pass_spread`.
    pub fail_reasons: Vec<String>,
}

fn push_reason(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}

pub fn score_symbol(stats: SpreadStats, cfg: &AppConfig) -> ScoreResult {
    let thresholds = &cfg.thresholds;
    let fees = &cfg.fees;
    let buffer = thresholds.slippage_buffer_bps;

    let edge_mm_bps = stats
        .spread_median_bps
        .map(|median| median - 2.0 * fees.maker_bps - buffer);
    let edge_mm_p25_bps = stats
        .spread_p25_bps
        .map(|p25| p25 - 2.0 * fees.maker_bps - buffer);
    let edge_mt_bps = stats
        .spread_median_bps
        .map(|median| median - (fees.maker_bps + fees.taker_bps) - buffer);
    let net_edge_bps = edge_mm_bps;

    let mut fail_reasons: Vec<String> = Vec::new();

    if stats.insufficient_samples {
        push_reason(&mut fail_reasons, "insufficient_samples");
    }
    if stats.invalid_quotes > 0 {
        push_reason(&mut fail_reasons, "invalid_quotes");
    }
    if stats.uptime < thresholds.uptime_min {
        push_reason(&mut fail_reasons, "low_uptime");
    }

    match stats.spread_median_bps {
        Some(median) => {
            if median < thresholds.spread.median_min_bps {
                push_reason(&mut fail_reasons, "spread_median_low");
            }
            if median > thresholds.spread.median_max_bps {
                push_reason(&mut fail_reasons, "spread_median_high");
            }
        }
        None => push_reason(&mut fail_reasons, "insufficient_samples"),
    }
    match stats.spread_p90_bps {
        Some(p90) => {
            if p90 < thresholds.spread.p90_min_bps {
                push_reason(&mut fail_reasons, "spread_p90_low");
            }
            if p90 > thresholds.spread.p90_max_bps {
                push_reason(&mut fail_reasons, "spread_p90_high");
            }
        }
        None => push_reason(&mut fail_reasons, "insufficient_samples"),
    }
    if let Some(edge) = edge_mm_bps {
        if edge < thresholds.edge_min_bps {
            push_reason(&mut fail_reasons, "edge_mm_low");
        }
    }

    // missing_24h_stats is informational; it never appears in fail_reasons.
    let pass_spread = fail_reasons.is_empty();

    let base_edge = edge_mm_bps.unwrap_or(0.0).max(0.0);
    let volatility_penalty = match (stats.spread_p90_bps, stats.spread_p10_bps) {
        (Some(p90), Some(p10)) => (p90 - p10).max(0.0),
        _ => 0.0,
    };
    let score = base_edge + stats.uptime * 100.0 - volatility_penalty;

    ScoreResult {
        symbol: stats.symbol.clone(),
        spread_stats: stats,
        edge_mm_bps,
        edge_mm_p25_bps,
        edge_mt_bps,
        net_edge_bps,
        pass_spread,
        score,
        fail_reasons,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringMetrics {
    pub symbols_pass_spread: u64,
    pub symbols_fail_spread: u64,
    pub symbols_insufficient_samples: u64,
}

pub fn collect_scoring_metrics(results: &[ScoreResult]) -> ScoringMetrics {
    let mut metrics = ScoringMetrics::default();
    for result in results {
        if result.pass_spread {
            metrics.symbols_pass_spread += 1;
        } else {
            metrics.symbols_fail_spread += 1;
        }
        if result.spread_stats.insufficient_samples {
            metrics.symbols_insufficient_samples += 1;
        }
    }
    metrics
}

pub fn log_scoring_done(events: &EventLogger, results: &[ScoreResult], top_n: usize) {
    let pass_count = results.iter().filter(|r| r.pass_spread).count();
    let mut ranked: Vec<&ScoreResult> = results.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    let top_symbols: Vec<&str> = ranked.iter().take(top_n).map(|r| r.symbol.as_str()).collect();

    events.info(
        "scoring_done",
        "scoring",
        "Scoring completed",
        json!({
            "pass_count": pass_count,
            "fail_count": results.len() - pass_count,
            "top_symbols": top_symbols,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.finalize().unwrap();
        cfg
    }

    fn healthy_stats() -> SpreadStats {
        SpreadStats {
            symbol: "AAAUSDT".to_string(),
            sample_count: 10,
            valid_samples: 10,
            invalid_quotes: 0,
            spread_median_bps: Some(10.0),
            spread_p10_bps: Some(8.0),
            spread_p25_bps: Some(9.0),
            spread_p90_bps: Some(12.0),
            uptime: 1.0,
            insufficient_samples: false,
            ..SpreadStats::default()
        }
    }

    #[test]
    fn test_edge_math() {
        let mut cfg = config();
        cfg.fees.maker_bps = 2.0;
        cfg.fees.taker_bps = 4.0;
        cfg.thresholds.slippage_buffer_bps = 2.0;

        let mut stats = healthy_stats();
        stats.spread_median_bps = Some(10.0);
        stats.spread_p25_bps = Some(7.0);

        let result = score_symbol(stats, &cfg);
        assert_eq!(result.edge_mm_bps, Some(4.0));
        assert_eq!(result.edge_mm_p25_bps, Some(1.0));
        assert_eq!(result.edge_mt_bps, Some(2.0));
        assert_eq!(result.net_edge_bps, Some(4.0));
    }

    #[test]
    fn test_pass_iff_no_fail_reasons() {
        let cfg = config();
        let result = score_symbol(healthy_stats(), &cfg);
        assert!(result.pass_spread, "fail_reasons: {:?}", result.fail_reasons);
        assert!(result.fail_reasons.is_empty());

        let mut low_uptime = healthy_stats();
        low_uptime.uptime = 0.5;
        let result = score_symbol(low_uptime, &cfg);
        assert!(!result.pass_spread);
        assert_eq!(result.fail_reasons, vec!["low_uptime"]);
    }

    #[test]
    fn test_threshold_band_reasons() {
        let mut cfg = config();
        cfg.thresholds.spread.median_min_bps = 5.0;
        cfg.thresholds.spread.p90_min_bps = 5.0;

        let mut tight = healthy_stats();
        tight.spread_median_bps = Some(4.0);
        tight.spread_p10_bps = Some(3.0);
        tight.spread_p25_bps = Some(3.5);
        tight.spread_p90_bps = Some(4.5);
        let result = score_symbol(tight, &cfg);
        assert!(result.fail_reasons.contains(&"spread_median_low".to_string()));
        assert!(result.fail_reasons.contains(&"spread_p90_low".to_string()));
        assert!(result.fail_reasons.contains(&"edge_mm_low".to_string()));

        let mut wide = healthy_stats();
        wide.spread_median_bps = Some(40.0);
        wide.spread_p90_bps = Some(90.0);
        let result = score_symbol(wide, &cfg);
        assert!(result.fail_reasons.contains(&"spread_median_high".to_string()));
        assert!(result.fail_reasons.contains(&"spread_p90_high".to_string()));
    }

    #[test]
    fn test_missing_percentiles_collapse_to_insufficient() {
        let cfg = config();
        let result = score_symbol(SpreadStats::empty("AAAUSDT"), &cfg);
        assert!(!result.pass_spread);
        assert_eq!(
            result
                .fail_reasons
                .iter()
                .filter(|r| *r == "insufficient_samples")
                .count(),
            1,
            "reason must be deduplicated"
        );
        assert_eq!(result.edge_mm_bps, None);
    }

    #[test]
    fn test_missing_24h_stats_never_fails_scoring() {
        let cfg = config();
        let mut stats = healthy_stats();
        stats.missing_24h_stats = true;
        stats.missing_24h_reason = Some("no_row".to_string());
        let result = score_symbol(stats, &cfg);
        assert!(result.pass_spread);
        assert!(result.fail_reasons.is_empty());
    }

    #[test]
    fn test_score_formula() {
        let cfg = config();
        let result = score_symbol(healthy_stats(), &cfg);
        // edge_mm = 10 - 4 - 2 = 4; penalty = 12 - 8 = 4; uptime term = 100.
        assert!((result.score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_collect_scoring_metrics() {
        let cfg = config();
        let pass = score_symbol(healthy_stats(), &cfg);
        let fail = score_symbol(SpreadStats::empty("BBBUSDT"), &cfg);
        let metrics = collect_scoring_metrics(&[pass, fail]);
        assert_eq!(metrics.symbols_pass_spread, 1);
        assert_eq!(metrics.symbols_fail_spread, 1);
        assert_eq!(metrics.symbols_insufficient_samples, 1);
    }
}
