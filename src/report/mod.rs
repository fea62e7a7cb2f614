//! Shortlist selection and the human-readable run report.
//!
//! Reads the summary/depth artifacts back from disk (not from memory) so
//! a report can be regenerated for any finished run directory.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::io::summary_export::SUMMARY_COLUMNS;
use crate::obs::metrics::{read_metrics, summarize_api_health, update_metrics};
use crate::obs::EventLogger;

#[derive(Debug, Clone)]
struct SummaryRow {
    symbol: String,
    spread_median_bps: Option<f64>,
    spread_p90_bps: Option<f64>,
    edge_mm_bps: Option<f64>,
    pass_spread: bool,
    score: f64,
    fail_reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct EnrichedRow {
    symbol: String,
    score: f64,
    pass_spread: bool,
    pass_depth: Option<bool>,
    pass_total: bool,
    depth_fail_reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct DepthRow {
    pass_depth: bool,
    uptime: Option<f64>,
    depth_fail_reasons: Vec<String>,
}

fn parse_opt_f64(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn split_reasons(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn csv_rows(path: &Path, required: &[&str]) -> anyhow::Result<Vec<std::collections::HashMap<String, String>>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let names: Vec<String> = headers.iter().map(str::to_string).collect();
    let missing: Vec<&str> = required
        .iter()
        .filter(|col| !names.iter().any(|n| n == *col))
        .copied()
        .collect();
    anyhow::ensure!(
        missing.is_empty(),
        "Incompatible {} format (missing columns: {})",
        path.file_name().unwrap_or_default().to_string_lossy(),
        missing.join(", ")
    );

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: std::collections::HashMap<String, String> = names
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn read_summary(path: &Path) -> anyhow::Result<Vec<SummaryRow>> {
    let rows = csv_rows(path, &SUMMARY_COLUMNS)?;
    Ok(rows
        .into_iter()
        .map(|row| SummaryRow {
            symbol: row.get("symbol").cloned().unwrap_or_default(),
            spread_median_bps: row.get("spread_median_bps").and_then(|v| parse_opt_f64(v)),
            spread_p90_bps: row.get("spread_p90_bps").and_then(|v| parse_opt_f64(v)),
            edge_mm_bps: row.get("edge_mm_bps").and_then(|v| parse_opt_f64(v)),
            pass_spread: row.get("pass_spread").map(|v| parse_bool(v)).unwrap_or(false),
            score: row.get("score").and_then(|v| parse_opt_f64(v)).unwrap_or(0.0),
            fail_reasons: row.get("fail_reasons").map(|v| split_reasons(v)).unwrap_or_default(),
        })
        .collect())
}

fn read_enriched(path: &Path) -> anyhow::Result<Vec<EnrichedRow>> {
    let rows = csv_rows(
        path,
        &["symbol", "score", "pass_spread", "pass_depth", "pass_total", "depth_fail_reasons"],
    )?;
    Ok(rows
        .into_iter()
        .map(|row| EnrichedRow {
            symbol: row.get("symbol").cloned().unwrap_or_default(),
            score: row.get("score").and_then(|v| parse_opt_f64(v)).unwrap_or(0.0),
            pass_spread: row.get("pass_spread").map(|v| parse_bool(v)).unwrap_or(false),
            pass_depth: Some(row.get("pass_depth").map(|v| parse_bool(v)).unwrap_or(false)),
            pass_total: row.get("pass_total").map(|v| parse_bool(v)).unwrap_or(false),
            depth_fail_reasons: row
                .get("depth_fail_reasons")
                .map(|v| split_reasons(v))
                .unwrap_or_default(),
        })
        .collect())
}

fn read_depth_rows(path: &Path) -> anyhow::Result<Vec<DepthRow>> {
    let rows = csv_rows(path, &["symbol", "pass_depth", "uptime", "depth_fail_reasons"])?;
    Ok(rows
        .into_iter()
        .map(|row| DepthRow {
            pass_depth: row.get("pass_depth").map(|v| parse_bool(v)).unwrap_or(false),
            uptime: row.get("uptime").and_then(|v| parse_opt_f64(v)),
            depth_fail_reasons: row
                .get("depth_fail_reasons")
                .map(|v| split_reasons(v))
                .unwrap_or_default(),
        })
        .collect())
}

fn quantile(sorted: &[f64], prob: f64) -> Option<f64> {
    crate::analytics::spread_stats::percentile(sorted, prob)
}

fn fmt_value(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string())
}

fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut lines = vec![
        format!("| {} |", headers.join(" | ")),
        format!("| {} |", vec!["---"; headers.len()].join(" | ")),
    ];
    for row in rows {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines
}

fn build_shortlist(
    summary_rows: &[SummaryRow],
    enriched: Option<&[EnrichedRow]>,
    top_n: usize,
    edge_min_bps: f64,
) -> Vec<EnrichedRow> {
    let mut rows: Vec<EnrichedRow> = match enriched {
        Some(rows) => rows.to_vec(),
        None => summary_rows
            .iter()
            .map(|row| EnrichedRow {
                symbol: row.symbol.clone(),
                score: row.score,
                pass_spread: row.pass_spread,
                pass_depth: None,
                pass_total: row.pass_spread
                    && row.edge_mm_bps.map(|edge| edge >= edge_min_bps).unwrap_or(false),
                depth_fail_reasons: Vec::new(),
            })
            .collect(),
    };

    rows.sort_by(|a, b| {
        (!a.pass_total)
            .cmp(&!b.pass_total)
            .then_with(|| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    rows.truncate(top_n);
    rows
}

fn write_shortlist(path: &Path, rows: &[EnrichedRow]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["symbol", "score", "pass_spread", "pass_depth", "pass_total"])?;
    for row in rows {
        writer.write_record([
            row.symbol.clone(),
            format!("{:.6}", row.score),
            row.pass_spread.to_string(),
            row.pass_depth.map(|v| v.to_string()).unwrap_or_default(),
            row.pass_total.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn render_report(
    run_meta: &Value,
    metrics_payload: Option<&serde_json::Map<String, Value>>,
    cfg: &AppConfig,
    summary_rows: &[SummaryRow],
    enriched: Option<&[EnrichedRow]>,
    depth_rows: Option<&[DepthRow]>,
    shortlist_rows: &[EnrichedRow],
) -> String {
    let mut lines: Vec<String> = vec!["# Report".into(), String::new()];

    let meta_str = |key: &str| {
        run_meta
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    lines.extend([
        "## Run meta".into(),
        String::new(),
        format!("- Run ID: {}", meta_str("run_id")),
        format!("- Started at: {}", meta_str("started_at")),
        format!("- Report generated at: {}", crate::io::layout::now_iso()),
        format!("- Git commit: {}", meta_str("git_commit")),
        String::new(),
        "### Parameters".into(),
        String::new(),
        format!(
            "- Spread sampling: duration_s={}, interval_s={}, min_uptime={}",
            cfg.sampling.spread.duration_s,
            cfg.sampling.spread.interval_s,
            cfg.sampling.spread.min_uptime
        ),
        format!(
            "- Depth sampling: duration_s={}, interval_s={}, limit={}",
            cfg.sampling.depth.duration_s, cfg.sampling.depth.interval_s, cfg.sampling.depth.limit
        ),
        format!(
            "- Spread thresholds: median_min_bps={}, median_max_bps={}, p90_min_bps={}, p90_max_bps={}",
            cfg.thresholds.spread.median_min_bps,
            cfg.thresholds.spread.median_max_bps,
            cfg.thresholds.spread.p90_min_bps,
            cfg.thresholds.spread.p90_max_bps
        ),
        format!(
            "- Fees: maker_bps={}, taker_bps={}",
            cfg.fees.maker_bps, cfg.fees.taker_bps
        ),
        format!(
            "- Edge thresholds: edge_min_bps={}, slippage_buffer_bps={} (edge_mm = spread - 2*maker - buffer)",
            cfg.thresholds.edge_min_bps, cfg.thresholds.slippage_buffer_bps
        ),
        format!(
            "- Depth thresholds: best_level_min_notional={}, unwind_slippage_max_bps={}, band_10bps_min_notional={}, topn_min_notional={}",
            cfg.thresholds.depth.best_level_min_notional,
            cfg.thresholds.depth.unwind_slippage_max_bps,
            cfg.thresholds.depth.band_10bps_min_notional,
            cfg.thresholds.depth.topn_min_notional
        ),
        format!(
            "- Depth optional checks: enable_band_checks={}, enable_topn_checks={}",
            cfg.depth.enable_band_checks, cfg.depth.enable_topn_checks
        ),
        format!("- Report shortlist size: top_n={}", cfg.report.top_n),
        String::new(),
        "## API health summary".into(),
        String::new(),
    ]);

    match metrics_payload {
        Some(payload) => {
            let health = summarize_api_health(payload);
            let run_health = run_meta
                .get("run_health")
                .and_then(Value::as_str)
                .unwrap_or(health.run_health);
            lines.extend([
                format!("- Run health: {run_health}"),
                format!("- HTTP 429 total: {}", health.http_429_total),
                format!("- HTTP 403 total: {}", health.http_403_total),
                format!("- HTTP 5xx total: {}", health.http_5xx_total),
            ]);
        }
        None => {
            let run_health = meta_str("run_health");
            lines.push(format!(
                "- Run health: {}",
                if run_health.is_empty() { "n/a" } else { run_health.as_str() }
            ));
            lines.push("- HTTP metrics unavailable.".into());
        }
    }

    lines.extend([String::new(), "## Universe stats".into(), String::new()]);
    let pass_spread_count = summary_rows.iter().filter(|r| r.pass_spread).count();
    let pass_total_count = match enriched {
        Some(rows) => rows.iter().filter(|r| r.pass_total).count(),
        None => summary_rows
            .iter()
            .filter(|r| {
                r.pass_spread
                    && r.edge_mm_bps
                        .map(|edge| edge >= cfg.thresholds.edge_min_bps)
                        .unwrap_or(false)
            })
            .count(),
    };
    lines.extend([
        format!("- Symbols scanned: {}", summary_rows.len()),
        format!("- PASS_SPREAD: {pass_spread_count}"),
        format!("- PASS_TOTAL: {pass_total_count}"),
        String::new(),
        "## Spread stats quantiles".into(),
        String::new(),
    ]);

    let mut medians: Vec<f64> = summary_rows.iter().filter_map(|r| r.spread_median_bps).collect();
    let mut p90s: Vec<f64> = summary_rows.iter().filter_map(|r| r.spread_p90_bps).collect();
    medians.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
    p90s.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
    let probs = [0.1, 0.25, 0.5, 0.75, 0.9];
    let quantile_rows: Vec<Vec<String>> = probs
        .iter()
        .map(|prob| {
            vec![
                format!("p{}", (prob * 100.0) as u32),
                fmt_value(quantile(&medians, *prob)),
                fmt_value(quantile(&p90s, *prob)),
            ]
        })
        .collect();
    lines.extend(markdown_table(
        &["Quantile", "spread_median_bps", "spread_p90_bps"],
        &quantile_rows,
    ));

    lines.extend([String::new(), "## Depth check results".into(), String::new()]);
    match enriched {
        None => lines.push("- Depth stage: no depth stage (summary_enriched.csv missing)".into()),
        Some(enriched_rows) => match depth_rows {
            Some(depth_rows) if !depth_rows.is_empty() => {
                let pass_depth_count = depth_rows.iter().filter(|r| r.pass_depth).count();
                lines.push(format!("- Depth candidates checked: {}", depth_rows.len()));
                lines.push(format!("- PASS_DEPTH: {pass_depth_count}"));
                let mut uptimes: Vec<f64> = depth_rows.iter().filter_map(|r| r.uptime).collect();
                if !uptimes.is_empty() {
                    uptimes.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
                    lines.push(format!("- Depth uptime p50: {}", fmt_value(quantile(&uptimes, 0.5))));
                }
            }
            _ => {
                let pass_depth_count = enriched_rows
                    .iter()
                    .filter(|r| r.pass_depth.unwrap_or(false))
                    .count();
                lines.push(format!("- Depth symbols (from enriched): {}", enriched_rows.len()));
                lines.push(format!("- PASS_DEPTH: {pass_depth_count}"));
            }
        },
    }

    lines.extend([String::new(), "## Top candidates".into(), String::new()]);
    if shortlist_rows.is_empty() {
        lines.push("No candidates qualified for the shortlist.".into());
    } else {
        let rows: Vec<Vec<String>> = shortlist_rows
            .iter()
            .map(|row| {
                vec![
                    row.symbol.clone(),
                    format!("{:.2}", row.score),
                    if row.pass_spread { "yes" } else { "no" }.to_string(),
                    match row.pass_depth {
                        Some(true) => "yes".to_string(),
                        Some(false) => "no".to_string(),
                        None => "n/a".to_string(),
                    },
                    if row.pass_total { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();
        lines.extend(markdown_table(
            &["symbol", "score", "pass_spread", "pass_depth", "pass_total"],
            &rows,
        ));
    }

    lines.extend([String::new(), "## Fail reason breakdown".into(), String::new()]);
    let mut spread_reasons: std::collections::BTreeMap<String, usize> = Default::default();
    for row in summary_rows {
        for reason in &row.fail_reasons {
            *spread_reasons.entry(reason.clone()).or_insert(0) += 1;
        }
    }
    if spread_reasons.is_empty() {
        lines.push("- No spread failures recorded.".into());
    } else {
        lines.push("### Spread stage".into());
        lines.push(String::new());
        let rows: Vec<Vec<String>> = spread_reasons
            .iter()
            .map(|(reason, count)| vec![reason.clone(), count.to_string()])
            .collect();
        lines.extend(markdown_table(&["reason", "count"], &rows));
    }

    lines.push(String::new());
    match enriched {
        None => lines.push("- Depth stage not executed.".into()),
        Some(enriched_rows) => {
            let mut depth_reasons: std::collections::BTreeMap<String, usize> = Default::default();
            let reason_source: Vec<&Vec<String>> = match depth_rows {
                Some(rows) if !rows.is_empty() => {
                    rows.iter().map(|r| &r.depth_fail_reasons).collect()
                }
                _ => enriched_rows.iter().map(|r| &r.depth_fail_reasons).collect(),
            };
            for reasons in reason_source {
                for reason in reasons {
                    *depth_reasons.entry(reason.clone()).or_insert(0) += 1;
                }
            }
            if depth_reasons.is_empty() {
                lines.push("- No depth failures recorded.".into());
            } else {
                lines.push("### Depth stage".into());
                lines.push(String::new());
                let rows: Vec<Vec<String>> = depth_reasons
                    .iter()
                    .map(|(reason, count)| vec![reason.clone(), count.to_string()])
                    .collect();
                lines.extend(markdown_table(&["reason", "count"], &rows));
            }
        }
    }

    if shortlist_rows.is_empty() {
        lines.push(String::new());
        lines.push(
            "Shortlist is empty. Common reasons are strict spread/depth thresholds or low uptime. \
             See the breakdown above for details."
                .into(),
        );
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Build the shortlist, write `shortlist.csv` and `report.md`, and return
/// the shortlist size.
pub fn generate_report(
    run_dir: &Path,
    cfg: &AppConfig,
    metrics_path: &Path,
    events: &EventLogger,
) -> anyhow::Result<usize> {
    let summary_path = run_dir.join("summary.csv");
    anyhow::ensure!(summary_path.exists(), "summary.csv not found in {}", run_dir.display());
    let run_meta_path = run_dir.join("run_meta.json");
    anyhow::ensure!(run_meta_path.exists(), "run_meta.json not found in {}", run_dir.display());

    let run_meta: Value = serde_json::from_str(&fs::read_to_string(&run_meta_path)?)?;
    let summary_rows = read_summary(&summary_path)?;

    let enriched_path = run_dir.join("summary_enriched.csv");
    let enriched = if enriched_path.exists() {
        Some(read_enriched(&enriched_path)?)
    } else {
        None
    };

    let depth_path = run_dir.join("depth_metrics.csv");
    let depth_rows = if depth_path.exists() {
        Some(read_depth_rows(&depth_path)?)
    } else {
        None
    };

    let shortlist_rows = build_shortlist(
        &summary_rows,
        enriched.as_deref(),
        cfg.report.top_n,
        cfg.thresholds.edge_min_bps,
    );
    write_shortlist(&run_dir.join("shortlist.csv"), &shortlist_rows)?;

    let metrics_payload = if metrics_path.exists() {
        Some(read_metrics(metrics_path))
    } else {
        None
    };

    let report = render_report(
        &run_meta,
        metrics_payload.as_ref(),
        cfg,
        &summary_rows,
        enriched.as_deref(),
        depth_rows.as_deref(),
        &shortlist_rows,
    );
    fs::write(run_dir.join("report.md"), report)?;

    update_metrics(
        metrics_path,
        &[("report_generated_total", 1)],
        &[("shortlist_size", json!(shortlist_rows.len()))],
    );
    // An empty shortlist is still a successful run, but a degraded one.
    if shortlist_rows.is_empty() {
        update_metrics(metrics_path, &[], &[("run_degraded", json!(1))]);
    }

    events.info(
        "report_generated",
        "report",
        "Report generated",
        json!({"shortlist_count": shortlist_rows.len()}),
    );

    Ok(shortlist_rows.len())
}
