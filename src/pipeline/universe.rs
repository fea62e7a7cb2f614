//! Universe construction: filter all listed symbols down to a tradable
//! candidate set.
//!
//! Filter order (first match rejects): default-list membership, catalog
//! metadata, quote asset, exchange status, blacklist, 24h stats
//! availability, then (unless whitelisted) volume and trade-count floors.
//! Reason codes are part of the artifact contract and must not change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use regex::Regex;
use serde_json::json;

use crate::config::UniverseConfig;
use crate::mexc::{ExchangeSymbol, MarketApi};
use crate::models::universe::{SourceFlags, UniverseReject, UniverseResult, UniverseStats};
use crate::obs::EventLogger;
use crate::pipeline::ticker_24h::{build_ticker_24h_stats, Ticker24hBuild};

/// Raised when the universe cannot be built safely.
#[derive(Debug)]
pub struct UniverseBuildError(pub String);

impl fmt::Display for UniverseBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UniverseBuildError {}

fn status_string(entry: &ExchangeSymbol) -> Option<String> {
    entry.status.as_ref().map(|status| match status {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[derive(Debug)]
pub struct UniverseBuild {
    pub result: UniverseResult,
    pub ticker: Ticker24hBuild,
}

pub async fn build_universe(
    api: &dyn MarketApi,
    cfg: &UniverseConfig,
    events: &EventLogger,
) -> anyhow::Result<UniverseBuild> {
    let exchange_info = api.get_exchange_info().await?;
    let mut catalog: HashMap<String, ExchangeSymbol> = HashMap::new();
    for entry in exchange_info.symbols {
        if let Some(symbol) = entry.symbol.clone() {
            catalog.insert(symbol, entry);
        }
    }

    let default_symbols = api.get_default_symbols().await?;
    if default_symbols.is_empty() {
        return Err(
            UniverseBuildError("defaultSymbols empty or unavailable; cannot build universe".into())
                .into(),
        );
    }
    let default_set: BTreeSet<&str> = default_symbols.iter().map(String::as_str).collect();

    // Candidate set: union of catalog and default list, ascending unique.
    let mut candidates: BTreeSet<String> = catalog.keys().cloned().collect();
    candidates.extend(default_symbols.iter().cloned());
    let candidates: Vec<String> = candidates.into_iter().collect();

    let ticker_payload = api.get_ticker_24hr().await?;
    let book_payload = api.get_book_ticker().await?;
    let ticker = build_ticker_24h_stats(
        &ticker_payload,
        &book_payload,
        &candidates,
        cfg.use_quote_volume_estimate,
        cfg.require_trade_count,
    );

    let blacklist: Vec<Regex> = cfg
        .blacklist_regex
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<_, _>>()
        .map_err(|err| UniverseBuildError(format!("Invalid blacklist regex: {err}")))?;
    let whitelist: BTreeSet<&str> = cfg.whitelist.iter().map(String::as_str).collect();
    let allowed_status: BTreeSet<&str> =
        cfg.allowed_exchange_status.iter().map(String::as_str).collect();

    let mut kept: Vec<String> = Vec::new();
    let mut rejects: Vec<UniverseReject> = Vec::new();
    let mut source_flags: BTreeMap<String, SourceFlags> = BTreeMap::new();

    fn reject(rejects: &mut Vec<UniverseReject>, symbol: &str, reason: &str) {
        rejects.push(UniverseReject {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        });
    }

    for symbol in &candidates {
        let entry = catalog.get(symbol);
        source_flags.insert(
            symbol.clone(),
            SourceFlags {
                in_catalog: entry.is_some(),
                in_default_list: default_set.contains(symbol.as_str()),
                exchange_status: entry.and_then(status_string),
                quote_asset: entry.and_then(|e| e.quote_asset.clone()),
            },
        );

        if !default_set.contains(symbol.as_str()) {
            reject(&mut rejects, symbol, "not_in_default_list");
            continue;
        }
        let Some(entry) = entry else {
            reject(&mut rejects, symbol, "metadata_missing");
            continue;
        };
        if entry.quote_asset.as_deref() != Some(cfg.quote_asset.as_str()) {
            reject(&mut rejects, symbol, "quote_asset_not_allowed");
            continue;
        }
        let status = status_string(entry);
        if !status
            .as_deref()
            .map(|s| allowed_status.contains(s))
            .unwrap_or(false)
        {
            reject(&mut rejects, symbol, "status_not_allowed");
            continue;
        }
        if blacklist.iter().any(|pattern| pattern.is_match(symbol)) {
            reject(&mut rejects, symbol, "blacklisted");
            continue;
        }

        let stats = ticker
            .stats
            .get(symbol)
            .expect("ticker stats cover every candidate");
        if stats.missing_24h_stats {
            let reason = if stats.missing_24h_reason.as_deref() == Some("missing_trade_count") {
                "missing_trade_count"
            } else {
                "missing_24h_stats"
            };
            reject(&mut rejects, symbol, reason);
            continue;
        }

        if whitelist.contains(symbol.as_str()) {
            events.info(
                "universe_whitelist_bypass",
                "universe",
                "Whitelist symbol bypassed 24h filters",
                json!({"symbol": symbol}),
            );
            kept.push(symbol.clone());
            continue;
        }

        match stats.quote_volume_effective {
            Some(volume) if volume >= cfg.min_quote_volume_24h => {}
            _ => {
                reject(&mut rejects, symbol, "low_volume");
                continue;
            }
        }
        if let Some(trades) = stats.trade_count {
            if trades < cfg.min_trades_24h {
                reject(&mut rejects, symbol, "low_trades");
                continue;
            }
        }

        kept.push(symbol.clone());
    }

    let stats = UniverseStats {
        total: candidates.len(),
        kept: kept.len(),
        rejected: rejects.len(),
    };

    let mut reason_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in &rejects {
        *reason_counts.entry(item.reason.as_str()).or_insert(0) += 1;
    }
    let mut top_reasons: Vec<(&str, usize)> = reason_counts.into_iter().collect();
    top_reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    top_reasons.truncate(5);
    let top_reasons_json: Vec<serde_json::Value> = top_reasons
        .iter()
        .map(|(reason, count)| json!({"reason": reason, "count": count}))
        .collect();

    events.info(
        "universe_reject_summary",
        "universe",
        "Universe reject summary",
        json!({
            "total": stats.total,
            "kept": stats.kept,
            "rejected": stats.rejected,
            "top_reject_reasons": top_reasons_json,
        }),
    );

    if kept.is_empty() {
        events.error(
            "universe_empty",
            "universe",
            "Universe filtered to 0 symbols",
            json!({"total": stats.total, "rejected": stats.rejected}),
        );
        return Err(
            UniverseBuildError("Universe filtered to 0 symbols; relax thresholds".into()).into(),
        );
    }

    events.info(
        "universe_built",
        "universe",
        "Universe built",
        json!({"total": stats.total, "kept": stats.kept, "rejected": stats.rejected}),
    );

    Ok(UniverseBuild {
        result: UniverseResult {
            symbols: kept,
            rejects,
            stats,
            source_flags,
        },
        ticker,
    })
}
