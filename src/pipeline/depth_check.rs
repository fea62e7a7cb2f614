//! Depth sampling: poll order books for the spread-ranked candidates and
//! evaluate the liquidity criteria.
//!
//! When the per-tick request load exceeds the rate budget
//! (`candidates / max_rps > interval_s`) the loop drops into snapshot
//! mode: as many full passes as fit into the configured duration, at
//! least one.

use std::collections::HashMap;

use serde_json::json;
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::analytics::depth_metrics::{
    aggregate_depth_metrics, compute_snapshot_metrics, DepthSnapshotMetrics, SnapshotError,
};
use crate::analytics::scoring::ScoreResult;
use crate::config::AppConfig;
use crate::mexc::{MarketApi, MexcHttpError};
use crate::models::depth::{DepthCheckResult, DepthSymbolMetrics};
use crate::obs::EventLogger;

#[derive(Debug, Default)]
struct SymbolState {
    snapshots: Vec<DepthSnapshotMetrics>,
    sample_count: u64,
    valid_samples: u64,
    empty_book_count: u64,
    invalid_book_count: u64,
    symbol_unavailable_count: u64,
}

/// Spread-passing candidates ranked `(-score, symbol)`, capped at
/// `limit`. Empty when nothing passed spread.
pub fn select_candidates(results: &[ScoreResult], limit: usize) -> Vec<String> {
    let mut passing: Vec<&ScoreResult> = results.iter().filter(|r| r.pass_spread).collect();
    passing.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    passing.truncate(limit);
    passing.iter().map(|r| r.symbol.clone()).collect()
}

fn push_reason(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}

pub async fn run_depth_check(
    api: &dyn MarketApi,
    candidates: &[ScoreResult],
    cfg: &AppConfig,
    events: &EventLogger,
    deadline: Option<Instant>,
) -> anyhow::Result<DepthCheckResult> {
    let sampling = &cfg.sampling.depth;
    let depth_cfg = &cfg.depth;
    let thresholds = &cfg.thresholds.depth;

    anyhow::ensure!(sampling.interval_s > 0.0, "interval_s must be positive");
    anyhow::ensure!(sampling.duration_s > 0, "duration_s must be positive");
    anyhow::ensure!(
        sampling.limit > 0 && sampling.limit <= 5000,
        "depth sampling limit must be between 1 and 5000"
    );
    anyhow::ensure!(depth_cfg.top_n_levels > 0, "top_n_levels must be positive");

    let symbols = select_candidates(candidates, depth_cfg.candidates_limit);
    let mut states: HashMap<&str, SymbolState> = symbols
        .iter()
        .map(|symbol| (symbol.as_str(), SymbolState::default()))
        .collect();

    // Effective tick count: fall back to snapshot mode when one pass over
    // the candidates cannot fit into the interval at the global rate cap.
    let tick_duration_s = symbols.len() as f64 / cfg.mexc.max_rps;
    let target_ticks = if symbols.is_empty() {
        0
    } else if tick_duration_s > sampling.interval_s {
        ((sampling.duration_s as f64 / tick_duration_s).floor() as u64).max(1)
    } else {
        ((sampling.duration_s as f64 / sampling.interval_s).ceil() as u64).max(1)
    };

    let mut ticks_success = 0u64;
    let mut ticks_fail = 0u64;
    let mut depth_requests_total = 0u64;
    let mut depth_fail_total = 0u64;
    let mut timed_out = false;
    let mut backoff = Duration::from_millis(500);
    let backoff_cap = Duration::from_secs(8);

    let start = Instant::now();
    'ticks: for tick_idx in 0..target_ticks {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            timed_out = true;
            events.warn(
                "stage_timeout_warning",
                "depth_check",
                "Stage deadline reached during depth sampling",
                json!({
                    "stage": "depth",
                    "tick_idx": tick_idx,
                    "elapsed_s": start.elapsed().as_secs_f64(),
                }),
            );
            break;
        }

        let mut tick_successful = false;
        for symbol in &symbols {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                timed_out = true;
                events.warn(
                    "stage_timeout_warning",
                    "depth_check",
                    "Stage deadline reached during depth sampling",
                    json!({
                        "stage": "depth",
                        "tick_idx": tick_idx,
                        "elapsed_s": start.elapsed().as_secs_f64(),
                    }),
                );
                break 'ticks;
            }

            depth_requests_total += 1;
            let state = states.get_mut(symbol.as_str()).expect("state per candidate");
            let request_start = Instant::now();
            match api.get_depth(symbol, sampling.limit).await {
                Ok(payload) => {
                    let latency_ms = request_start.elapsed().as_secs_f64() * 1000.0;
                    state.sample_count += 1;
                    match compute_snapshot_metrics(
                        &payload.bids,
                        &payload.asks,
                        depth_cfg.top_n_levels,
                        &depth_cfg.band_bps,
                        depth_cfg.stress_notional_usdt,
                    ) {
                        Ok(metrics) => {
                            state.snapshots.push(metrics);
                            state.valid_samples += 1;
                            tick_successful = true;
                            backoff = Duration::from_millis(500);
                            events.info(
                                "depth_tick",
                                "depth_check",
                                "Depth snapshot collected",
                                json!({
                                    "symbol": symbol,
                                    "levels": {
                                        "bids": payload.bids.len(),
                                        "asks": payload.asks.len(),
                                    },
                                    "latency_ms": latency_ms,
                                    "tick_idx": tick_idx,
                                }),
                            );
                        }
                        Err(err) => {
                            depth_fail_total += 1;
                            let reason = match err {
                                SnapshotError::EmptyBook => {
                                    state.empty_book_count += 1;
                                    "empty_book"
                                }
                                SnapshotError::InvalidLevels(_) => {
                                    state.invalid_book_count += 1;
                                    "invalid_book_levels"
                                }
                            };
                            events.warn(
                                "depth_tick_invalid",
                                "depth_check",
                                "Depth snapshot invalid",
                                json!({"symbol": symbol, "reason": reason, "tick_idx": tick_idx}),
                            );
                        }
                    }
                }
                Err(err @ MexcHttpError::Fatal(_)) => {
                    depth_fail_total += 1;
                    state.symbol_unavailable_count += 1;
                    events.warn(
                        "depth_tick_unavailable",
                        "depth_check",
                        "Depth snapshot unavailable",
                        json!({"symbol": symbol, "error": err.to_string(), "tick_idx": tick_idx}),
                    );
                }
                Err(err) => {
                    depth_fail_total += 1;
                    events.warn(
                        "depth_tick_fail",
                        "depth_check",
                        "Depth snapshot failed",
                        json!({"symbol": symbol, "error": err.to_string(), "tick_idx": tick_idx}),
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_cap);
                }
            }
        }

        if tick_successful {
            ticks_success += 1;
        } else {
            ticks_fail += 1;
        }

        let next_tick = start + Duration::from_secs_f64((tick_idx + 1) as f64 * sampling.interval_s);
        let wake = match deadline {
            Some(d) if d < next_tick => d,
            _ => next_tick,
        };
        if wake > Instant::now() {
            sleep_until(wake).await;
        }
    }

    let elapsed_s = start.elapsed().as_secs_f64();

    let mut results: Vec<DepthSymbolMetrics> = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let state = &states[symbol.as_str()];
        let aggregates = aggregate_depth_metrics(&state.snapshots, &depth_cfg.band_bps);
        let uptime = if target_ticks > 0 {
            state.valid_samples as f64 / target_ticks as f64
        } else {
            0.0
        };

        let mut fail_reasons: Vec<String> = Vec::new();

        let best_bid_notional_pass = match aggregates.best_bid_notional_median {
            Some(median) => {
                if median < thresholds.best_level_min_notional {
                    push_reason(&mut fail_reasons, "best_bid_notional_low");
                }
                median >= thresholds.best_level_min_notional
            }
            None => {
                push_reason(&mut fail_reasons, "missing_best_level_notional");
                false
            }
        };
        let best_ask_notional_pass = match aggregates.best_ask_notional_median {
            Some(median) => {
                if median < thresholds.best_level_min_notional {
                    push_reason(&mut fail_reasons, "best_ask_notional_low");
                }
                median >= thresholds.best_level_min_notional
            }
            None => {
                push_reason(&mut fail_reasons, "missing_best_level_notional");
                false
            }
        };
        let unwind_slippage_pass = match aggregates.unwind_slippage_p90_bps {
            Some(p90) => {
                if p90 > thresholds.unwind_slippage_max_bps {
                    push_reason(&mut fail_reasons, "unwind_slippage_high");
                }
                p90 <= thresholds.unwind_slippage_max_bps
            }
            None => {
                push_reason(&mut fail_reasons, "missing_unwind_slippage");
                false
            }
        };

        let band_10bps_notional_pass = if depth_cfg.enable_band_checks {
            Some(match aggregates.band_bid_notional_median.get(&10) {
                Some(median) => {
                    if *median < thresholds.band_10bps_min_notional {
                        push_reason(&mut fail_reasons, "band_10bps_notional_low");
                    }
                    *median >= thresholds.band_10bps_min_notional
                }
                None => {
                    push_reason(&mut fail_reasons, "missing_band_10bps_notional");
                    false
                }
            })
        } else {
            None
        };

        let topn_notional_pass = if depth_cfg.enable_topn_checks {
            Some(
                match (
                    aggregates.topn_bid_notional_median,
                    aggregates.topn_ask_notional_median,
                ) {
                    (Some(bid), Some(ask)) => {
                        let passes = bid.min(ask) >= thresholds.topn_min_notional;
                        if !passes {
                            push_reason(&mut fail_reasons, "topn_notional_low");
                        }
                        passes
                    }
                    _ => {
                        push_reason(&mut fail_reasons, "missing_topn_notional");
                        false
                    }
                },
            )
        } else {
            None
        };

        let pass_depth = fail_reasons.is_empty();

        results.push(DepthSymbolMetrics {
            symbol: symbol.clone(),
            sample_count: state.sample_count,
            valid_samples: state.valid_samples,
            empty_book_count: state.empty_book_count,
            invalid_book_count: state.invalid_book_count,
            symbol_unavailable_count: state.symbol_unavailable_count,
            best_bid_notional_median: aggregates.best_bid_notional_median,
            best_ask_notional_median: aggregates.best_ask_notional_median,
            topn_bid_notional_median: aggregates.topn_bid_notional_median,
            topn_ask_notional_median: aggregates.topn_ask_notional_median,
            band_bid_notional_median: aggregates.band_bid_notional_median,
            band_ask_notional_median: aggregates.band_ask_notional_median,
            unwind_slippage_p90_bps: aggregates.unwind_slippage_p90_bps,
            uptime,
            best_bid_notional_pass,
            best_ask_notional_pass,
            unwind_slippage_pass,
            band_10bps_notional_pass,
            topn_notional_pass,
            pass_depth,
            fail_reasons,
        });
    }

    let depth_symbols_pass_total = results.iter().filter(|r| r.pass_depth).count() as u64;
    events.info(
        "depth_done",
        "depth_check",
        "Depth check completed",
        json!({
            "candidates": symbols.len(),
            "pass_depth_count": depth_symbols_pass_total,
            "timed_out": timed_out,
        }),
    );

    Ok(DepthCheckResult {
        target_ticks,
        ticks_success,
        ticks_fail,
        symbols: results,
        depth_requests_total,
        depth_fail_total,
        depth_symbols_pass_total,
        timed_out,
        elapsed_s,
    })
}
