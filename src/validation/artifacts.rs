//! Validators for the on-disk artifacts each stage produces.
//!
//! Validators return `Ok(())` or a human-readable error that ends up in
//! `pipeline_state.json` under `ArtifactValidationError`.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::io::summary_export::SUMMARY_COLUMNS;

fn missing(path: &Path) -> String {
    format!("Missing file: {}", file_name(path))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn csv_has_columns(path: &Path, columns: &[String], require_rows: bool) -> Result<(), String> {
    if !path.exists() {
        return Err(missing(path));
    }
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| format!("Unreadable CSV {}: {err}", file_name(path)))?;
    let headers = reader
        .headers()
        .map_err(|_| format!("Missing CSV header: {}", file_name(path)))?
        .clone();
    let header_set: Vec<&str> = headers.iter().collect();
    let missing_cols: Vec<&str> = columns
        .iter()
        .map(String::as_str)
        .filter(|col| !header_set.contains(col))
        .collect();
    if !missing_cols.is_empty() {
        return Err(format!(
            "Missing columns in {}: {}",
            file_name(path),
            missing_cols.join(", ")
        ));
    }
    if require_rows {
        let mut records = reader.records();
        if records.next().is_none() {
            return Err(format!("CSV has no rows: {}", file_name(path)));
        }
    }
    Ok(())
}

pub fn validate_universe(path: &Path, strict: bool) -> Result<(), String> {
    if !path.exists() {
        return Err(missing(path));
    }
    let text = fs::read_to_string(path)
        .map_err(|err| format!("Unreadable {}: {err}", file_name(path)))?;
    let payload: Value = serde_json::from_str(&text)
        .map_err(|err| format!("Invalid JSON in {}: {err}", file_name(path)))?;
    let Some(object) = payload.as_object() else {
        return Err(format!("Universe payload must be an object: {}", file_name(path)));
    };
    let Some(symbols) = object.get("symbols").and_then(Value::as_array) else {
        return Err(format!("Universe symbols must be a list: {}", file_name(path)));
    };
    if strict && symbols.is_empty() {
        return Err(format!("Universe symbols empty: {}", file_name(path)));
    }
    Ok(())
}

pub fn validate_summary_csv(path: &Path, strict: bool) -> Result<(), String> {
    let columns: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect();
    csv_has_columns(path, &columns, strict)
}

/// Depth metrics may legitimately have zero rows (no candidate passed
/// spread), so rows are never required.
pub fn validate_depth_metrics(path: &Path, band_bps: &[u32], _strict: bool) -> Result<(), String> {
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
    for band in band_bps {
        columns.push(format!("band_bid_notional_median_{band}bps"));
    }
    for band in band_bps {
        columns.push(format!("band_ask_notional_median_{band}bps"));
    }
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
    csv_has_columns(path, &columns, false)
}

pub fn validate_report_md(path: &Path, strict: bool) -> Result<(), String> {
    if !path.exists() {
        return Err(missing(path));
    }
    if strict {
        let content = fs::read_to_string(path)
            .map_err(|err| format!("Unreadable {}: {err}", file_name(path)))?;
        if content.trim().is_empty() {
            return Err(format!("Report is empty: {}", file_name(path)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_universe_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("universe.json");

        assert!(validate_universe(&path, true).unwrap_err().contains("Missing file"));

        fs::write(&path, "not json").unwrap();
        assert!(validate_universe(&path, true).unwrap_err().contains("Invalid JSON"));

        fs::write(&path, r#"{"symbols": []}"#).unwrap();
        assert!(validate_universe(&path, false).is_ok());
        assert!(validate_universe(&path, true).unwrap_err().contains("empty"));

        fs::write(&path, r#"{"symbols": ["AAAUSDT"]}"#).unwrap();
        assert!(validate_universe(&path, true).is_ok());
    }

    #[test]
    fn test_validate_summary_csv_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "symbol,score").unwrap();
        let err = validate_summary_csv(&path, false).unwrap_err();
        assert!(err.contains("Missing columns"));

        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "{}", SUMMARY_COLUMNS.join(",")).unwrap();
        assert!(validate_summary_csv(&path, false).is_ok());
        // Strict requires at least one data row.
        assert!(validate_summary_csv(&path, true).unwrap_err().contains("no rows"));
    }

    #[test]
    fn test_validate_depth_metrics_header_only_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth_metrics.csv");
        let bands = vec![5u32, 10, 20];
        let mut header: Vec<String> = vec![
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
        .into_iter()
        .map(String::from)
        .collect();
        for band in &bands {
            header.push(format!("band_bid_notional_median_{band}bps"));
        }
        for band in &bands {
            header.push(format!("band_ask_notional_median_{band}bps"));
        }
        header.extend(
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
            .into_iter()
            .map(String::from),
        );
        fs::write(&path, format!("{}\n", header.join(","))).unwrap();
        assert!(validate_depth_metrics(&path, &bands, true).is_ok());
    }
}
