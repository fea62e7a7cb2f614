//! `universe.json` and `universe_rejects.csv` writers.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::models::universe::UniverseResult;

#[derive(Debug, Clone)]
pub struct UniverseExportPaths {
    pub universe_path: PathBuf,
    pub rejects_path: PathBuf,
}

pub fn export_universe(
    output_dir: &Path,
    result: &UniverseResult,
) -> anyhow::Result<UniverseExportPaths> {
    fs::create_dir_all(output_dir)?;

    let universe_path = output_dir.join("universe.json");
    let rejects_path = output_dir.join("universe_rejects.csv");

    let payload = json!({
        "symbols": result.symbols,
        "stats": {
            "total": result.stats.total,
            "kept": result.stats.kept,
            "rejected": result.stats.rejected,
        },
        "source_flags": result.source_flags,
    });
    fs::write(&universe_path, serde_json::to_string_pretty(&payload)?)?;

    let mut writer = csv::Writer::from_path(&rejects_path)?;
    writer.write_record(["symbol", "reason"])?;
    for reject in &result.rejects {
        writer.write_record([reject.symbol.as_str(), reject.reason.as_str()])?;
    }
    writer.flush()?;

    Ok(UniverseExportPaths {
        universe_path,
        rejects_path,
    })
}

/// Symbols kept by a previous universe stage, for downstream stages.
pub fn read_universe_symbols(run_dir: &Path) -> anyhow::Result<Vec<String>> {
    let path = run_dir.join("universe.json");
    let text = fs::read_to_string(&path)?;
    let payload: serde_json::Value = serde_json::from_str(&text)?;
    let symbols = payload
        .get("symbols")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("universe.json symbols must be a list"))?;
    Ok(symbols
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::universe::{SourceFlags, UniverseReject, UniverseStats};
    use std::collections::BTreeMap;

    #[test]
    fn test_export_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let result = UniverseResult {
            symbols: vec!["AAAUSDT".into(), "BBBUSDT".into()],
            rejects: vec![UniverseReject {
                symbol: "CCCUSDT".into(),
                reason: "low_volume".into(),
            }],
            stats: UniverseStats {
                total: 3,
                kept: 2,
                rejected: 1,
            },
            source_flags: BTreeMap::from([(
                "AAAUSDT".to_string(),
                SourceFlags {
                    in_catalog: true,
                    in_default_list: true,
                    exchange_status: Some("1".into()),
                    quote_asset: Some("USDT".into()),
                },
            )]),
        };

        export_universe(dir.path(), &result).unwrap();
        let symbols = read_universe_symbols(dir.path()).unwrap();
        assert_eq!(symbols, vec!["AAAUSDT", "BBBUSDT"]);

        let rejects = fs::read_to_string(dir.path().join("universe_rejects.csv")).unwrap();
        assert!(rejects.starts_with("symbol,reason"));
        assert!(rejects.contains("CCCUSDT,low_volume"));
    }
}
