//! Stage descriptors and bodies.
//!
//! A static list of descriptors (name, declared inputs/outputs) drives the
//! orchestrator; execution and artifact validation dispatch on the stage
//! name. No graph machinery: the canonical order is a five-element array.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::analytics::scoring::{collect_scoring_metrics, log_scoring_done, score_symbol, ScoreResult};
use crate::analytics::spread_stats::compute_spread_stats;
use crate::config::AppConfig;
use crate::io::depth_export::{export_depth_metrics, export_summary_enriched};
use crate::io::export_universe::{export_universe, read_universe_symbols};
use crate::io::raw_writer::raw_bookticker_name;
use crate::io::summary_export::{export_summary, read_summary_json};
use crate::mexc::MarketApi;
use crate::models::parse_float;
use crate::models::spread::SpreadSample;
use crate::obs::EventLogger;
use crate::pipeline::depth_check::run_depth_check;
use crate::pipeline::spread_sampling::run_spread_sampling;
use crate::pipeline::ticker_24h::build_ticker_24h_stats;
use crate::pipeline::universe::build_universe;
use crate::report::generate_report;
use crate::validation::artifacts::{
    validate_depth_metrics, validate_report_md, validate_summary_csv, validate_universe,
};
use crate::validation::ValidationMode;

pub const STAGE_ORDER: [&str; 5] = ["universe", "spread", "score", "depth", "report"];

/// Everything a stage body needs; borrowed from the runner for the
/// duration of one stage.
pub struct StageContext<'a> {
    pub run_dir: &'a Path,
    pub config: &'a AppConfig,
    pub api: &'a dyn MarketApi,
    pub events: &'a EventLogger,
    pub metrics_path: &'a Path,
    pub artifact_validation: ValidationMode,
    /// Effective deadline (grace included) for the running stage body.
    pub stage_deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: &'static str,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

pub fn default_stage_definitions(cfg: &AppConfig) -> Vec<StageDefinition> {
    let spread_raw = raw_bookticker_name(cfg.sampling.raw.gzip).to_string();
    vec![
        StageDefinition {
            name: "universe",
            inputs: vec![],
            outputs: vec!["universe.json".into(), "universe_rejects.csv".into()],
        },
        StageDefinition {
            name: "spread",
            inputs: vec!["universe.json".into()],
            outputs: vec![spread_raw.clone()],
        },
        StageDefinition {
            name: "score",
            inputs: vec!["universe.json".into(), spread_raw],
            outputs: vec!["summary.csv".into(), "summary.json".into()],
        },
        StageDefinition {
            name: "depth",
            inputs: vec!["summary.csv".into()],
            outputs: vec!["depth_metrics.csv".into(), "summary_enriched.csv".into()],
        },
        StageDefinition {
            name: "report",
            inputs: vec!["summary.csv".into(), "run_meta.json".into()],
            outputs: vec!["report.md".into(), "shortlist.csv".into()],
        },
    ]
}

pub fn validate_stage_names(names: &[String]) -> Result<Vec<String>, String> {
    let invalid: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| !STAGE_ORDER.contains(name))
        .collect();
    if !invalid.is_empty() {
        return Err(format!("Unknown stages: {}", invalid.join(", ")));
    }
    Ok(names.to_vec())
}

/// Stage lists must follow the canonical order; gaps are fine, backward
/// jumps are not.
pub fn ensure_stage_order(names: &[String]) -> Result<(), String> {
    let positions: HashMap<&str, usize> = STAGE_ORDER
        .iter()
        .enumerate()
        .map(|(idx, name)| (*name, idx))
        .collect();
    let mut last = 0usize;
    let mut first = true;
    for name in names {
        let idx = positions[name.as_str()];
        if !first && idx < last {
            return Err(format!(
                "Stages must follow fixed order: {}",
                STAGE_ORDER.join(" -> ")
            ));
        }
        last = idx;
        first = false;
    }
    Ok(())
}

fn raw_bookticker_path(run_dir: &Path, cfg: &AppConfig) -> PathBuf {
    run_dir.join(raw_bookticker_name(cfg.sampling.raw.gzip))
}

// =============================================================================
// ARTIFACT VALIDATION (PRE/POSTCONDITIONS)
// =============================================================================

fn validate_outputs_universe(ctx: &StageContext<'_>) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(err) = validate_universe(
        &ctx.run_dir.join("universe.json"),
        ctx.artifact_validation.is_strict(),
    ) {
        errors.push(err);
    }
    if !ctx.run_dir.join("universe_rejects.csv").exists() {
        errors.push("Missing universe_rejects.csv".to_string());
    }
    errors
}

fn validate_outputs_spread(ctx: &StageContext<'_>) -> Vec<String> {
    let raw_path = raw_bookticker_path(ctx.run_dir, ctx.config);
    if !raw_path.exists() {
        return vec![format!(
            "Missing {}",
            raw_path.file_name().unwrap_or_default().to_string_lossy()
        )];
    }
    if ctx.artifact_validation.is_strict() {
        let empty = raw_path.metadata().map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            return vec![format!(
                "{} is empty",
                raw_path.file_name().unwrap_or_default().to_string_lossy()
            )];
        }
    }
    Vec::new()
}

fn validate_outputs_score(ctx: &StageContext<'_>) -> Vec<String> {
    if let Err(err) = validate_summary_csv(
        &ctx.run_dir.join("summary.csv"),
        ctx.artifact_validation.is_strict(),
    ) {
        return vec![err];
    }
    if !ctx.run_dir.join("summary.json").exists() {
        return vec!["Missing summary.json".to_string()];
    }
    Vec::new()
}

fn validate_outputs_depth(ctx: &StageContext<'_>) -> Vec<String> {
    if let Err(err) = validate_depth_metrics(
        &ctx.run_dir.join("depth_metrics.csv"),
        &ctx.config.depth.band_bps,
        ctx.artifact_validation.is_strict(),
    ) {
        return vec![err];
    }
    if !ctx.run_dir.join("summary_enriched.csv").exists() {
        return vec!["Missing summary_enriched.csv".to_string()];
    }
    Vec::new()
}

fn validate_outputs_report(ctx: &StageContext<'_>) -> Vec<String> {
    if let Err(err) = validate_report_md(
        &ctx.run_dir.join("report.md"),
        ctx.artifact_validation.is_strict(),
    ) {
        return vec![err];
    }
    if !ctx.run_dir.join("shortlist.csv").exists() {
        return vec!["Missing shortlist.csv".to_string()];
    }
    Vec::new()
}

pub fn validate_inputs(name: &str, ctx: &StageContext<'_>) -> Vec<String> {
    match name {
        "universe" => Vec::new(),
        "spread" => validate_outputs_universe(ctx),
        "score" => {
            let mut errors = validate_outputs_universe(ctx);
            errors.extend(validate_outputs_spread(ctx));
            errors
        }
        "depth" => validate_outputs_score(ctx),
        "report" => {
            let mut errors = Vec::new();
            if let Err(err) = validate_summary_csv(
                &ctx.run_dir.join("summary.csv"),
                ctx.artifact_validation.is_strict(),
            ) {
                errors.push(err);
            }
            if !ctx.run_dir.join("run_meta.json").exists() {
                errors.push("Missing run_meta.json".to_string());
            }
            errors
        }
        _ => vec![format!("Unknown stage: {name}")],
    }
}

pub fn validate_outputs(name: &str, ctx: &StageContext<'_>) -> Vec<String> {
    match name {
        "universe" => validate_outputs_universe(ctx),
        "spread" => validate_outputs_spread(ctx),
        "score" => validate_outputs_score(ctx),
        "depth" => validate_outputs_depth(ctx),
        "report" => validate_outputs_report(ctx),
        _ => vec![format!("Unknown stage: {name}")],
    }
}

// =============================================================================
// STAGE BODIES
// =============================================================================

/// Raw samples per universe symbol from the spread stage's JSONL output.
fn read_spread_samples(
    raw_path: &Path,
    symbols: &[String],
) -> anyhow::Result<HashMap<String, Vec<SpreadSample>>> {
    let universe: HashSet<&str> = symbols.iter().map(String::as_str).collect();
    let mut samples: HashMap<String, Vec<SpreadSample>> =
        symbols.iter().map(|s| (s.clone(), Vec::new())).collect();

    let file = File::open(raw_path)?;
    let reader: Box<dyn Read> = if raw_path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    for line in BufReader::new(reader).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(symbol) = payload.get("symbol").and_then(Value::as_str) else {
            continue;
        };
        if !universe.contains(symbol) {
            continue;
        }
        let bid = payload.get("bid").and_then(parse_float);
        let ask = payload.get("ask").and_then(parse_float);
        let (Some(bid), Some(ask)) = (bid, ask) else {
            continue;
        };
        samples.get_mut(symbol).expect("universe symbol").push(SpreadSample {
            symbol: symbol.to_string(),
            bid,
            ask,
        });
    }

    Ok(samples)
}

async fn run_universe_stage(ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    let build = build_universe(ctx.api, &ctx.config.universe, ctx.events).await?;
    export_universe(ctx.run_dir, &build.result)?;

    let mut metrics = Map::new();
    metrics.insert("symbols_total".into(), json!(build.result.stats.total));
    metrics.insert("symbols_kept".into(), json!(build.result.stats.kept));
    metrics.insert("symbols_rejected".into(), json!(build.result.stats.rejected));
    Ok(metrics)
}

async fn run_spread_stage(ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    let symbols = read_universe_symbols(ctx.run_dir)?;
    let result = run_spread_sampling(
        ctx.api,
        &symbols,
        &ctx.config.sampling,
        ctx.run_dir,
        ctx.events,
        ctx.stage_deadline,
    )
    .await?;

    let mut metrics = Map::new();
    metrics.insert("target_ticks".into(), json!(result.target_ticks));
    metrics.insert("ticks_total".into(), json!(result.ticks_success + result.ticks_fail));
    metrics.insert("ticks_success".into(), json!(result.ticks_success));
    metrics.insert("ticks_fail".into(), json!(result.ticks_fail));
    metrics.insert("uptime".into(), json!(result.uptime));
    metrics.insert("invalid_quotes".into(), json!(result.invalid_quotes));
    metrics.insert("missing_quotes".into(), json!(result.missing_quotes));
    metrics.insert("low_quality".into(), json!(result.low_quality));
    metrics.insert("timed_out".into(), json!(result.timed_out));
    metrics.insert("elapsed_s".into(), json!(result.elapsed_s));
    Ok(metrics)
}

async fn run_score_stage(ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    let symbols = read_universe_symbols(ctx.run_dir)?;
    let raw_path = raw_bookticker_path(ctx.run_dir, ctx.config);
    let samples_by_symbol = read_spread_samples(&raw_path, &symbols)?;

    let ticker_payload = ctx.api.get_ticker_24hr().await?;
    let book_payload = ctx.api.get_book_ticker().await?;
    let ticker = build_ticker_24h_stats(
        &ticker_payload,
        &book_payload,
        &symbols,
        ctx.config.universe.use_quote_volume_estimate,
        ctx.config.universe.require_trade_count,
    );

    let mut results: Vec<ScoreResult> = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let samples = samples_by_symbol.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
        let mut stats = compute_spread_stats(symbol, samples);
        if let Some(enrichment) = ticker.stats.get(symbol) {
            stats.quote_volume_24h_raw = enrichment.quote_volume_raw;
            stats.volume_24h_raw = enrichment.volume_raw;
            stats.mid_price = enrichment.mid_price;
            stats.quote_volume_24h_est = enrichment.quote_volume_est;
            stats.quote_volume_24h_effective = enrichment.quote_volume_effective;
            stats.trades_24h = enrichment.trade_count;
            stats.missing_24h_stats = enrichment.missing_24h_stats;
            stats.missing_24h_reason = enrichment.missing_24h_reason.clone();
        }
        results.push(score_symbol(stats, ctx.config));
    }

    export_summary(ctx.run_dir, &results)?;
    log_scoring_done(ctx.events, &results, 5);

    let scoring = collect_scoring_metrics(&results);
    let mut metrics = Map::new();
    metrics.insert("symbols_scored".into(), json!(results.len()));
    metrics.insert("symbols_pass_spread".into(), json!(scoring.symbols_pass_spread));
    metrics.insert("symbols_fail_spread".into(), json!(scoring.symbols_fail_spread));
    metrics.insert(
        "symbols_insufficient_samples".into(),
        json!(scoring.symbols_insufficient_samples),
    );
    metrics.insert("ticker24h_rows_total".into(), json!(ticker.rows_total));
    metrics.insert("ticker24h_parse_fail_total".into(), json!(ticker.parse_errors));
    metrics.insert(
        "quote_volume_est_used_total".into(),
        json!(ticker.used_estimate_total),
    );
    metrics.insert("missing_24h_stats_symbols".into(), json!(ticker.missing_total));
    Ok(metrics)
}

async fn run_depth_stage(ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    let candidates = read_summary_json(ctx.run_dir)?;
    let result = run_depth_check(ctx.api, &candidates, ctx.config, ctx.events, ctx.stage_deadline)
        .await?;

    export_depth_metrics(ctx.run_dir, &result.symbols, &ctx.config.depth.band_bps)?;
    export_summary_enriched(
        ctx.run_dir,
        &candidates,
        &result.symbols,
        &ctx.config.depth.band_bps,
        ctx.config.thresholds.edge_min_bps,
    )?;

    let mut metrics = Map::new();
    metrics.insert("target_ticks".into(), json!(result.target_ticks));
    metrics.insert("ticks_total".into(), json!(result.ticks_success + result.ticks_fail));
    metrics.insert("ticks_success".into(), json!(result.ticks_success));
    metrics.insert("ticks_fail".into(), json!(result.ticks_fail));
    metrics.insert("depth_requests_total".into(), json!(result.depth_requests_total));
    metrics.insert("depth_fail_total".into(), json!(result.depth_fail_total));
    metrics.insert(
        "depth_symbols_pass_total".into(),
        json!(result.depth_symbols_pass_total),
    );
    metrics.insert("timed_out".into(), json!(result.timed_out));
    metrics.insert("elapsed_s".into(), json!(result.elapsed_s));
    Ok(metrics)
}

async fn run_report_stage(ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    let shortlist_size = generate_report(ctx.run_dir, ctx.config, ctx.metrics_path, ctx.events)?;
    let mut metrics = Map::new();
    metrics.insert("shortlist_size".into(), json!(shortlist_size));
    Ok(metrics)
}

pub async fn run_stage(name: &str, ctx: &StageContext<'_>) -> anyhow::Result<Map<String, Value>> {
    match name {
        "universe" => run_universe_stage(ctx).await,
        "spread" => run_spread_stage(ctx).await,
        "score" => run_score_stage(ctx).await,
        "depth" => run_depth_stage(ctx).await,
        "report" => run_report_stage(ctx).await,
        _ => anyhow::bail!("Unknown stage: {name}"),
    }
}
