//! 24-hour activity enrichment.
//!
//! Joins `ticker/24hr` rows with book-ticker midprices per symbol and
//! derives an effective quote volume: the raw `quoteVolume` when it
//! parses, else (when enabled) `volume * mid` as an estimate.
//! `missing_24h_stats` is set only for a missing row or a parse error;
//! null fields on a well-formed row are not "missing" per se.

use std::collections::HashMap;

use serde_json::Value;

use crate::mexc::{BookTickerRow, TickerRow};
use crate::models::parse_float;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ticker24hStats {
    pub symbol: String,
    pub quote_volume_raw: Option<f64>,
    pub volume_raw: Option<f64>,
    pub mid_price: Option<f64>,
    pub quote_volume_est: Option<f64>,
    pub quote_volume_effective: Option<f64>,
    pub trade_count: Option<i64>,
    pub missing_24h_stats: bool,
    pub missing_24h_reason: Option<String>,
    pub used_estimate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Ticker24hBuild {
    pub stats: HashMap<String, Ticker24hStats>,
    pub rows_total: u64,
    pub parse_errors: u64,
    pub used_estimate_total: u64,
    pub missing_total: u64,
}

#[derive(Debug, Clone, Copy)]
struct ParsedRow {
    quote_volume_raw: Option<f64>,
    volume_raw: Option<f64>,
    trade_count: Option<i64>,
    parse_error: bool,
}

/// `(value, ok)`: a null field is absent-but-ok, an unparseable field is a
/// parse error.
fn parse_field(value: Option<&Value>) -> (Option<f64>, bool) {
    match value {
        None | Some(Value::Null) => (None, true),
        Some(raw) => match parse_float(raw) {
            Some(parsed) => (Some(parsed), true),
            None => (None, false),
        },
    }
}

fn parse_count(value: Option<&Value>) -> (Option<i64>, bool) {
    let (parsed, ok) = parse_field(value);
    (parsed.map(|v| v as i64), ok)
}

fn mid_price(row: &BookTickerRow) -> Option<f64> {
    let bid = row.bid_price.as_ref().and_then(parse_float)?;
    let ask = row.ask_price.as_ref().and_then(parse_float)?;
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    let mid = (bid + ask) / 2.0;
    (mid.is_finite() && mid > 0.0).then_some(mid)
}

pub fn build_ticker_24h_stats(
    ticker_payload: &[TickerRow],
    book_payload: &[BookTickerRow],
    symbols: &[String],
    use_quote_volume_estimate: bool,
    require_trade_count: bool,
) -> Ticker24hBuild {
    let mut build = Ticker24hBuild {
        rows_total: ticker_payload.len() as u64,
        ..Ticker24hBuild::default()
    };

    let mut rows: HashMap<&str, ParsedRow> = HashMap::new();
    for entry in ticker_payload {
        let Some(symbol) = entry.symbol.as_deref().filter(|s| !s.is_empty()) else {
            build.parse_errors += 1;
            continue;
        };
        let (quote_volume_raw, quote_ok) = parse_field(entry.quote_volume.as_ref());
        let (volume_raw, volume_ok) = parse_field(entry.volume.as_ref());
        let (trade_count, count_ok) = parse_count(entry.count.as_ref());
        let mut parse_error = !quote_ok || !volume_ok;
        if require_trade_count && !count_ok {
            parse_error = true;
        }
        if parse_error {
            build.parse_errors += 1;
        }
        rows.insert(
            symbol,
            ParsedRow {
                quote_volume_raw,
                volume_raw,
                trade_count: if count_ok { trade_count } else { None },
                parse_error,
            },
        );
    }

    let mut mids: HashMap<&str, f64> = HashMap::new();
    for entry in book_payload {
        let Some(symbol) = entry.symbol.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        if let Some(mid) = mid_price(entry) {
            mids.insert(symbol, mid);
        }
    }

    for symbol in symbols {
        let mid = mids.get(symbol.as_str()).copied();
        let Some(row) = rows.get(symbol.as_str()) else {
            build.missing_total += 1;
            build.stats.insert(
                symbol.clone(),
                Ticker24hStats {
                    symbol: symbol.clone(),
                    mid_price: mid,
                    missing_24h_stats: true,
                    missing_24h_reason: Some("no_row".to_string()),
                    ..Ticker24hStats::default()
                },
            );
            continue;
        };

        if row.parse_error {
            build.missing_total += 1;
            build.stats.insert(
                symbol.clone(),
                Ticker24hStats {
                    symbol: symbol.clone(),
                    quote_volume_raw: row.quote_volume_raw,
                    volume_raw: row.volume_raw,
                    mid_price: mid,
                    trade_count: row.trade_count,
                    missing_24h_stats: true,
                    missing_24h_reason: Some("parse_error".to_string()),
                    ..Ticker24hStats::default()
                },
            );
            continue;
        }

        let mut quote_volume_est = None;
        let mut quote_volume_effective = row.quote_volume_raw;
        let mut used_estimate = false;
        if quote_volume_effective.is_none() && use_quote_volume_estimate {
            if let (Some(volume), Some(mid)) = (row.volume_raw, mid) {
                let estimate = volume * mid;
                quote_volume_est = Some(estimate);
                quote_volume_effective = Some(estimate);
                used_estimate = true;
            }
        }

        let mut missing = false;
        let mut missing_reason = None;
        if row.quote_volume_raw.is_none() && row.volume_raw.is_none() {
            missing = true;
            missing_reason = Some("no_any_fields".to_string());
        } else if row.quote_volume_raw.is_none() && quote_volume_effective.is_none() {
            missing = true;
            missing_reason = Some("no_volume_and_no_mid".to_string());
        }
        if require_trade_count && row.trade_count.is_none() {
            missing = true;
            missing_reason = missing_reason.or_else(|| Some("missing_trade_count".to_string()));
        }

        if used_estimate {
            build.used_estimate_total += 1;
        }
        if missing {
            build.missing_total += 1;
        }

        build.stats.insert(
            symbol.clone(),
            Ticker24hStats {
                symbol: symbol.clone(),
                quote_volume_raw: row.quote_volume_raw,
                volume_raw: row.volume_raw,
                mid_price: mid,
                quote_volume_est,
                quote_volume_effective,
                trade_count: row.trade_count,
                missing_24h_stats: missing,
                missing_24h_reason: missing_reason,
                used_estimate,
            },
        );
    }

    build
}
