//! Spread sampling: poll best bid/ask for the whole universe at a fixed
//! cadence and append raw quotes to the run's JSONL file.
//!
//! Each tick tries one bulk book-ticker fetch; on a fatal response the
//! loop can fall back to per-symbol requests when the universe is small
//! enough. The deadline is checked at every tick boundary and before each
//! fallback request, and the raw writer is flushed and closed on every
//! exit path.

use std::collections::HashSet;
use std::path::Path;

use serde_json::json;
use tokio::time::{sleep_until, Duration, Instant};

use crate::config::SamplingConfig;
use crate::io::layout::now_iso;
use crate::io::raw_writer::RawJsonlWriter;
use crate::mexc::{BookTickerRow, MarketApi, MexcHttpError};
use crate::models::spread::SpreadSamplingResult;
use crate::models::{parse_float, raw_value_string};
use crate::obs::EventLogger;

pub async fn run_spread_sampling(
    api: &dyn MarketApi,
    symbols: &[String],
    cfg: &SamplingConfig,
    out_dir: &Path,
    events: &EventLogger,
    deadline: Option<Instant>,
) -> anyhow::Result<SpreadSamplingResult> {
    let spread_cfg = &cfg.spread;
    anyhow::ensure!(spread_cfg.interval_s > 0.0, "interval_s must be positive");
    anyhow::ensure!(spread_cfg.duration_s > 0, "duration_s must be positive");

    let universe: HashSet<&str> = symbols.iter().map(String::as_str).collect();
    let target_ticks =
        ((spread_cfg.duration_s as f64 / spread_cfg.interval_s).ceil() as u64).max(1);

    let mut ticks_success = 0u64;
    let mut ticks_fail = 0u64;
    let mut invalid_quotes = 0u64;
    let mut missing_quotes = 0u64;
    let mut timed_out = false;

    let mut raw_writer = if cfg.raw.enabled {
        Some(RawJsonlWriter::create(out_dir, cfg.raw.gzip)?)
    } else {
        None
    };

    let start = Instant::now();
    for tick_idx in 0..target_ticks {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            timed_out = true;
            events.warn(
                "stage_timeout_warning",
                "spread_sampling",
                "Stage deadline reached during spread sampling",
                json!({
                    "stage": "spread",
                    "tick_idx": tick_idx,
                    "elapsed_s": start.elapsed().as_secs_f64(),
                }),
            );
            break;
        }

        let tick_ts = now_iso();
        let mut payload: Option<Vec<BookTickerRow>> = None;
        let mut latency_ms: Option<f64> = None;

        let request_start = Instant::now();
        match api.get_book_ticker().await {
            Ok(rows) => {
                latency_ms = Some(request_start.elapsed().as_secs_f64() * 1000.0);
                payload = Some(rows);
                ticks_success += 1;
            }
            Err(err @ MexcHttpError::Fatal(_)) => {
                if spread_cfg.allow_per_symbol {
                    if symbols.len() > spread_cfg.per_symbol_limit {
                        ticks_fail += 1;
                        missing_quotes += symbols.len() as u64;
                        events.warn(
                            "spread_tick_skip",
                            "spread_sampling",
                            "Per-symbol fallback skipped due to symbol limit",
                            json!({
                                "tick_idx": tick_idx,
                                "symbol_count": symbols.len(),
                                "per_symbol_limit": spread_cfg.per_symbol_limit,
                            }),
                        );
                    } else {
                        let mut rows: Vec<BookTickerRow> = Vec::new();
                        let mut failures = 0u64;
                        let fallback_start = Instant::now();
                        for symbol in symbols {
                            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                                timed_out = true;
                                break;
                            }
                            match api.get_book_ticker_symbol(symbol).await {
                                Ok(mut row) => {
                                    if row.symbol.is_none() {
                                        row.symbol = Some(symbol.clone());
                                    }
                                    rows.push(row);
                                }
                                Err(_) => failures += 1,
                            }
                        }
                        latency_ms = Some(fallback_start.elapsed().as_secs_f64() * 1000.0);
                        if rows.is_empty() {
                            ticks_fail += 1;
                        } else {
                            payload = Some(rows);
                            ticks_success += 1;
                        }
                        if failures > 0 {
                            events.warn(
                                "spread_tick_partial",
                                "spread_sampling",
                                "Per-symbol fallback had failures",
                                json!({"tick_idx": tick_idx, "failures": failures}),
                            );
                        }
                    }
                } else {
                    ticks_fail += 1;
                    events.warn(
                        "spread_tick_fail",
                        "spread_sampling",
                        "Bulk bookTicker failed; per-symbol fallback disabled",
                        json!({"tick_idx": tick_idx, "error": err.to_string()}),
                    );
                }
            }
            Err(err) => {
                ticks_fail += 1;
                events.warn(
                    "spread_tick_fail",
                    "spread_sampling",
                    "Bulk bookTicker failed",
                    json!({"tick_idx": tick_idx, "error": err.to_string()}),
                );
            }
        }

        let mut symbols_seen: HashSet<&str> = HashSet::new();
        if let Some(rows) = &payload {
            for row in rows {
                let Some(symbol) = row.symbol.as_deref() else {
                    continue;
                };
                let Some(symbol) = universe.get(symbol).copied() else {
                    continue;
                };
                let (Some(bid_raw), Some(ask_raw)) = (&row.bid_price, &row.ask_price) else {
                    invalid_quotes += 1;
                    continue;
                };
                let bid = parse_float(bid_raw);
                let ask = parse_float(ask_raw);
                match (bid, ask) {
                    // Crossed or locked books count as invalid quotes.
                    (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 && bid < ask => {
                        symbols_seen.insert(symbol);
                        if let Some(writer) = &mut raw_writer {
                            writer.write_record(&json!({
                                "ts": tick_ts,
                                "symbol": symbol,
                                "bid": raw_value_string(bid_raw),
                                "ask": raw_value_string(ask_raw),
                            }))?;
                        }
                    }
                    _ => invalid_quotes += 1,
                }
            }
            missing_quotes += (universe.len() - symbols_seen.len()) as u64;
        }

        events.info(
            "spread_tick",
            "spread_sampling",
            "Spread tick collected",
            json!({
                "tick_idx": tick_idx,
                "symbols_seen": symbols_seen.len(),
                "latency_ms": latency_ms,
            }),
        );

        if timed_out {
            break;
        }

        let next_tick = start + Duration::from_secs_f64((tick_idx + 1) as f64 * spread_cfg.interval_s);
        // Never sleep past the deadline; the next loop iteration handles it.
        let wake = match deadline {
            Some(d) if d < next_tick => d,
            _ => next_tick,
        };
        if wake > Instant::now() {
            sleep_until(wake).await;
        }
    }

    let raw_path = raw_writer.as_ref().map(|writer| writer.path().to_path_buf());
    if let Some(writer) = &mut raw_writer {
        writer.close()?;
    }

    let elapsed_s = start.elapsed().as_secs_f64();
    let uptime = ticks_success as f64 / target_ticks as f64;
    let low_quality = uptime < spread_cfg.min_uptime;

    events.info(
        "spread_sampling_done",
        "spread_sampling",
        "Spread sampling finished",
        json!({
            "ticks_total": ticks_success + ticks_fail,
            "ticks_success": ticks_success,
            "ticks_fail": ticks_fail,
            "uptime": uptime,
            "invalid_count": invalid_quotes,
            "missing_count": missing_quotes,
            "timed_out": timed_out,
        }),
    );

    Ok(SpreadSamplingResult {
        target_ticks,
        ticks_success,
        ticks_fail,
        invalid_quotes,
        missing_quotes,
        uptime,
        low_quality,
        timed_out,
        elapsed_s,
        raw_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::mexc::{DepthPayload, ExchangeInfo, TickerRow};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct TickApi {
        /// One entry per bulk call; `None` scripts a fatal error.
        bulk: Mutex<Vec<Option<Vec<BookTickerRow>>>>,
        per_symbol_calls: Mutex<u64>,
    }

    fn row(symbol: &str, bid: &str, ask: &str) -> BookTickerRow {
        BookTickerRow {
            symbol: Some(symbol.to_string()),
            bid_price: Some(Value::String(bid.to_string())),
            bid_qty: None,
            ask_price: Some(Value::String(ask.to_string())),
            ask_qty: None,
        }
    }

    #[async_trait]
    impl MarketApi for TickApi {
        async fn get_exchange_info(&self) -> Result<ExchangeInfo, MexcHttpError> {
            unreachable!()
        }
        async fn get_default_symbols(&self) -> Result<Vec<String>, MexcHttpError> {
            unreachable!()
        }
        async fn get_ticker_24hr(&self) -> Result<Vec<TickerRow>, MexcHttpError> {
            unreachable!()
        }
        async fn get_book_ticker(&self) -> Result<Vec<BookTickerRow>, MexcHttpError> {
            let mut bulk = self.bulk.lock();
            match bulk.pop() {
                Some(Some(rows)) => Ok(rows),
                Some(None) => Err(MexcHttpError::fatal("bulk disabled", Some(404), None)),
                None => Ok(vec![]),
            }
        }
        async fn get_book_ticker_symbol(&self, symbol: &str) -> Result<BookTickerRow, MexcHttpError> {
            *self.per_symbol_calls.lock() += 1;
            if symbol == "BADUSDT" {
                return Err(MexcHttpError::transient("boom", None, None));
            }
            Ok(row(symbol, "1.0", "1.1"))
        }
        async fn get_depth(&self, _symbol: &str, _limit: u32) -> Result<DepthPayload, MexcHttpError> {
            unreachable!()
        }
    }

    fn sampling_config(duration_s: u64, interval_s: f64) -> SamplingConfig {
        let mut cfg = AppConfig::default();
        cfg.sampling.spread.duration_s = duration_s;
        cfg.sampling.spread.interval_s = interval_s;
        cfg.sampling.raw.gzip = false;
        cfg.sampling.spread.min_uptime = 0.9;
        cfg.sampling
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_writes_valid_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let api = TickApi {
            // Popped from the back: tick 0 sees valid rows, tick 1 a mix.
            bulk: Mutex::new(vec![
                Some(vec![row("AAAUSDT", "2.0", "2.1"), row("OTHERUSDT", "9", "10")]),
                Some(vec![row("AAAUSDT", "1.0", "1.1"), row("BBBUSDT", "0", "1.0")]),
            ]),
            per_symbol_calls: Mutex::new(0),
        };

        let result = run_spread_sampling(
            &api,
            &symbols(&["AAAUSDT", "BBBUSDT"]),
            &sampling_config(2, 1.0),
            dir.path(),
            &EventLogger::disabled(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.target_ticks, 2);
        assert_eq!(result.ticks_success, 2);
        assert_eq!(result.ticks_fail, 0);
        assert_eq!(result.invalid_quotes, 1); // zero bid on BBBUSDT
        // Tick 0: BBBUSDT invalid => missing; tick 1: BBBUSDT absent.
        assert_eq!(result.missing_quotes, 2);
        assert!(!result.timed_out);
        assert!((result.uptime - 1.0).abs() < 1e-12);

        let text = std::fs::read_to_string(dir.path().join("raw_bookticker.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["symbol"], "AAAUSDT");
        assert_eq!(first["bid"], "1.0");
        // Off-universe symbols never reach the raw file.
        assert!(!text.contains("OTHERUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_symbol_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let api = TickApi {
            bulk: Mutex::new(vec![None]),
            per_symbol_calls: Mutex::new(0),
        };
        let mut cfg = sampling_config(1, 1.0);
        cfg.spread.allow_per_symbol = true;
        cfg.spread.per_symbol_limit = 10;

        let result = run_spread_sampling(
            &api,
            &symbols(&["AAAUSDT", "BADUSDT"]),
            &cfg,
            dir.path(),
            &EventLogger::disabled(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.ticks_success, 1);
        assert_eq!(*api.per_symbol_calls.lock(), 2);
        let text = std::fs::read_to_string(dir.path().join("raw_bookticker.jsonl")).unwrap();
        assert!(text.contains("AAAUSDT"));
        assert!(!text.contains("BADUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_skipped_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let api = TickApi {
            bulk: Mutex::new(vec![None]),
            per_symbol_calls: Mutex::new(0),
        };
        let mut cfg = sampling_config(1, 1.0);
        cfg.spread.allow_per_symbol = true;
        cfg.spread.per_symbol_limit = 1;

        let result = run_spread_sampling(
            &api,
            &symbols(&["AAAUSDT", "BBBUSDT"]),
            &cfg,
            dir.path(),
            &EventLogger::disabled(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.ticks_fail, 1);
        assert_eq!(result.missing_quotes, 2);
        assert_eq!(*api.per_symbol_calls.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_marks_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let api = TickApi {
            bulk: Mutex::new(vec![
                Some(vec![row("AAAUSDT", "1.0", "1.1")]),
                Some(vec![row("AAAUSDT", "1.0", "1.1")]),
            ]),
            per_symbol_calls: Mutex::new(0),
        };
        // 10 ticks of 1s, but the deadline lands inside tick 2's sleep.
        let deadline = Instant::now() + Duration::from_millis(1500);
        let result = run_spread_sampling(
            &api,
            &symbols(&["AAAUSDT"]),
            &sampling_config(10, 1.0),
            dir.path(),
            &EventLogger::disabled(),
            Some(deadline),
        )
        .await
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.target_ticks, 10);
        assert!(result.ticks_success >= 1);
        assert!(result.ticks_success <= 2);
        assert!(result.low_quality);
        // Partial raw output survives the deadline.
        assert!(dir.path().join("raw_bookticker.jsonl").exists());
    }
}
