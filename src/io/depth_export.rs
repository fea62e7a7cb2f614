//! `depth_metrics.csv` and `summary_enriched.csv` writers.

use std::fs;
use std::path::{Path, PathBuf};

use crate::analytics::scoring::ScoreResult;
use crate::models::depth::DepthSymbolMetrics;

#[derive(Debug, Clone)]
pub struct DepthExportPaths {
    pub depth_metrics_path: PathBuf,
    pub summary_enriched_path: PathBuf,
}

fn band_bid_columns(band_bps: &[u32]) -> Vec<String> {
    band_bps
        .iter()
        .map(|band| format!("band_bid_notional_median_{band}bps"))
        .collect()
}

fn band_ask_columns(band_bps: &[u32]) -> Vec<String> {
    band_bps
        .iter()
        .map(|band| format!("band_ask_notional_median_{band}bps"))
        .collect()
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn fmt_opt_bool(value: Option<bool>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One row per checked symbol, ascending by symbol.
pub fn export_depth_metrics(
    output_dir: &Path,
    results: &[DepthSymbolMetrics],
    band_bps: &[u32],
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let csv_path = output_dir.join("depth_metrics.csv");

    let mut columns: Vec<String> = [
        "symbol",
        "sample_count",
        "valid_samples",
        "empty_book_count",
        "invalid_book_count",
        "symbol_unavailable_count",
        "best_bid_notional_median",
        "best_ask_notional_median",
        "topn_bid_notional_median",
        "topn_ask_notional_median",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.extend(band_bid_columns(band_bps));
    columns.extend(band_ask_columns(band_bps));
    columns.extend(
        [
            "unwind_slippage_p90_bps",
            "uptime",
            "best_bid_notional_pass",
            "best_ask_notional_pass",
            "unwind_slippage_pass",
            "band_10bps_notional_pass",
            "topn_notional_pass",
            "pass_depth",
            "depth_fail_reasons",
        ]
        .iter()
        .map(|c| c.to_string()),
    );

    let mut sorted: Vec<&DepthSymbolMetrics> = results.iter().collect();
    sorted.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let mut writer = csv::Writer::from_path(&csv_path)?;
    writer.write_record(&columns)?;
    for result in sorted {
        let mut row: Vec<String> = vec![
            result.symbol.clone(),
            result.sample_count.to_string(),
            result.valid_samples.to_string(),
            result.empty_book_count.to_string(),
            result.invalid_book_count.to_string(),
            result.symbol_unavailable_count.to_string(),
            fmt_opt(result.best_bid_notional_median),
            fmt_opt(result.best_ask_notional_median),
            fmt_opt(result.topn_bid_notional_median),
            fmt_opt(result.topn_ask_notional_median),
        ];
        for band in band_bps {
            row.push(fmt_opt(result.band_bid_notional_median.get(band).copied()));
        }
        for band in band_bps {
            row.push(fmt_opt(result.band_ask_notional_median.get(band).copied()));
        }
        row.extend([
            fmt_opt(result.unwind_slippage_p90_bps),
            result.uptime.to_string(),
            result.best_bid_notional_pass.to_string(),
            result.best_ask_notional_pass.to_string(),
            result.unwind_slippage_pass.to_string(),
            fmt_opt_bool(result.band_10bps_notional_pass),
            fmt_opt_bool(result.topn_notional_pass),
            result.pass_depth.to_string(),
            result.fail_reasons.join(";"),
        ]);
        writer.write_record(&row)?;
    }
    writer.flush()?;

    Ok(csv_path)
}

/// Summary rows joined with the depth verdict; `pass_total` requires the
/// spread pass, the depth pass, and a market-making edge above the floor.
pub fn export_summary_enriched(
    output_dir: &Path,
    summary_results: &[ScoreResult],
    depth_results: &[DepthSymbolMetrics],
    band_bps: &[u32],
    edge_min_bps: f64,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let csv_path = output_dir.join("summary_enriched.csv");

    let mut columns: Vec<String> = [
        "symbol",
        "score",
        "pass_spread",
        "pass_depth",
        "best_bid_notional_pass",
        "best_ask_notional_pass",
        "unwind_slippage_pass",
        "band_10bps_notional_pass",
        "topn_notional_pass",
        "pass_total",
        "best_bid_notional_median",
        "best_ask_notional_median",
        "topn_bid_notional_median",
        "topn_ask_notional_median",
        "unwind_slippage_p90_bps",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    columns.extend(band_bid_columns(band_bps));
    columns.extend(band_ask_columns(band_bps));
    columns.push("depth_fail_reasons".to_string());

    let mut sorted: Vec<&ScoreResult> = summary_results.iter().collect();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let mut writer = csv::Writer::from_path(&csv_path)?;
    writer.write_record(&columns)?;
    for result in sorted {
        let depth = depth_results.iter().find(|d| d.symbol == result.symbol);
        let pass_depth = depth.map(|d| d.pass_depth).unwrap_or(false);
        let pass_total = result.pass_spread
            && pass_depth
            && result.edge_mm_bps.map(|edge| edge >= edge_min_bps).unwrap_or(false);

        let mut row: Vec<String> = vec![
            result.symbol.clone(),
            result.score.to_string(),
            result.pass_spread.to_string(),
            pass_depth.to_string(),
            depth.map(|d| d.best_bid_notional_pass.to_string()).unwrap_or_default(),
            depth.map(|d| d.best_ask_notional_pass.to_string()).unwrap_or_default(),
            depth.map(|d| d.unwind_slippage_pass.to_string()).unwrap_or_default(),
            depth.map(|d| fmt_opt_bool(d.band_10bps_notional_pass)).unwrap_or_default(),
            depth.map(|d| fmt_opt_bool(d.topn_notional_pass)).unwrap_or_default(),
            pass_total.to_string(),
            depth.map(|d| fmt_opt(d.best_bid_notional_median)).unwrap_or_default(),
            depth.map(|d| fmt_opt(d.best_ask_notional_median)).unwrap_or_default(),
            depth.map(|d| fmt_opt(d.topn_bid_notional_median)).unwrap_or_default(),
            depth.map(|d| fmt_opt(d.topn_ask_notional_median)).unwrap_or_default(),
            depth.map(|d| fmt_opt(d.unwind_slippage_p90_bps)).unwrap_or_default(),
        ];
        for band in band_bps {
            row.push(
                depth
                    .map(|d| fmt_opt(d.band_bid_notional_median.get(band).copied()))
                    .unwrap_or_default(),
            );
        }
        for band in band_bps {
            row.push(
                depth
                    .map(|d| fmt_opt(d.band_ask_notional_median.get(band).copied()))
                    .unwrap_or_default(),
            );
        }
        row.push(match depth {
            Some(d) => d.fail_reasons.join(";"),
            None => "no_depth_data".to_string(),
        });
        writer.write_record(&row)?;
    }
    writer.flush()?;

    Ok(csv_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::scoring::score_symbol;
    use crate::analytics::spread_stats::SpreadStats;
    use crate::config::AppConfig;
    use std::collections::BTreeMap;

    fn depth_row(symbol: &str, pass: bool) -> DepthSymbolMetrics {
        DepthSymbolMetrics {
            symbol: symbol.to_string(),
            sample_count: 4,
            valid_samples: 4,
            empty_book_count: 0,
            invalid_book_count: 0,
            symbol_unavailable_count: 0,
            best_bid_notional_median: Some(500.0),
            best_ask_notional_median: Some(400.0),
            topn_bid_notional_median: Some(2_000.0),
            topn_ask_notional_median: Some(1_500.0),
            band_bid_notional_median: BTreeMap::from([(5, 100.0), (10, 700.0), (20, 900.0)]),
            band_ask_notional_median: BTreeMap::from([(5, 90.0), (10, 600.0), (20, 800.0)]),
            unwind_slippage_p90_bps: Some(12.0),
            uptime: 1.0,
            best_bid_notional_pass: pass,
            best_ask_notional_pass: pass,
            unwind_slippage_pass: pass,
            band_10bps_notional_pass: None,
            topn_notional_pass: None,
            pass_depth: pass,
            fail_reasons: if pass { vec![] } else { vec!["unwind_slippage_high".into()] },
        }
    }

    fn passing_score(symbol: &str) -> ScoreResult {
        let mut cfg = AppConfig::default();
        cfg.finalize().unwrap();
        score_symbol(
            SpreadStats {
                symbol: symbol.to_string(),
                sample_count: 5,
                valid_samples: 5,
                spread_median_bps: Some(12.0),
                spread_p10_bps: Some(10.0),
                spread_p25_bps: Some(11.0),
                spread_p90_bps: Some(14.0),
                uptime: 1.0,
                ..SpreadStats::default()
            },
            &cfg,
        )
    }

    #[test]
    fn test_depth_metrics_rows_sorted_by_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let bands = vec![5, 10, 20];
        export_depth_metrics(
            dir.path(),
            &[depth_row("BBBUSDT", true), depth_row("AAAUSDT", false)],
            &bands,
        )
        .unwrap();

        let text = fs::read_to_string(dir.path().join("depth_metrics.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("band_bid_notional_median_10bps"));
        assert!(lines[0].contains("band_ask_notional_median_20bps"));
        assert!(lines[1].starts_with("AAAUSDT"));
        assert!(lines[2].starts_with("BBBUSDT"));
    }

    #[test]
    fn test_enriched_pass_total_requires_all_three() {
        let dir = tempfile::tempdir().unwrap();
        let bands = vec![5, 10, 20];
        let scores = vec![passing_score("AAAUSDT"), passing_score("BBBUSDT")];
        let depth = vec![depth_row("AAAUSDT", true), depth_row("BBBUSDT", false)];
        export_summary_enriched(dir.path(), &scores, &depth, &bands, 2.0).unwrap();

        let text = fs::read_to_string(dir.path().join("summary_enriched.csv")).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        let aaa = rows.iter().find(|r| r.starts_with("AAAUSDT")).unwrap();
        let bbb = rows.iter().find(|r| r.starts_with("BBBUSDT")).unwrap();
        let pass_total = |row: &str| row.split(',').nth(9).unwrap().to_string();
        assert_eq!(pass_total(aaa), "true");
        assert_eq!(pass_total(bbb), "false");
    }

    #[test]
    fn test_enriched_without_depth_data() {
        let dir = tempfile::tempdir().unwrap();
        let scores = vec![passing_score("AAAUSDT")];
        export_summary_enriched(dir.path(), &scores, &[], &[5, 10, 20], 2.0).unwrap();
        let text = fs::read_to_string(dir.path().join("summary_enriched.csv")).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.ends_with("no_depth_data"));
        assert!(row.contains(",false,")); // pass_depth defaults to false
    }
}
