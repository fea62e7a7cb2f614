//! Per-run directory layout and `run_meta.json` lifecycle.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::pipeline::state::PIPELINE_SPEC_VERSION;
use crate::SCANNER_VERSION;

#[derive(Debug, Clone)]
pub struct RunLayout {
    pub run_dir: PathBuf,
    pub log_path: Option<PathBuf>,
    pub run_meta_path: PathBuf,
    pub metrics_path: PathBuf,
}

/// `YYYYMMDD_HHMMSSZ_<6 hex chars>`.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%SZ");
    let mut suffix = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{timestamp}_{}", hex::encode(suffix))
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Create `<output>/run_<run_id>/` with seeded `metrics.json` and an empty
/// `logs.jsonl` when JSONL logging is enabled. Fails if the directory
/// already exists.
pub fn create_run_layout(
    output_dir: &Path,
    run_id: &str,
    config: &AppConfig,
) -> std::io::Result<RunLayout> {
    let run_dir = output_dir.join(format!("run_{run_id}"));
    fs::create_dir_all(output_dir)?;
    fs::create_dir(&run_dir)?;

    let log_path = if config.obs.log_jsonl {
        let path = run_dir.join("logs.jsonl");
        fs::write(&path, "")?;
        Some(path)
    } else {
        None
    };

    let metrics_path = run_dir.join("metrics.json");
    let seed = json!({
        "requests_total": 0,
        "errors_total": 0,
        "created_at": now_iso(),
    });
    fs::write(&metrics_path, serde_json::to_string_pretty(&seed)?)?;

    Ok(RunLayout {
        run_meta_path: run_dir.join("run_meta.json"),
        run_dir,
        log_path,
        metrics_path,
    })
}

pub struct RunMeta<'a> {
    pub run_id: &'a str,
    pub started_at: &'a str,
    pub git_commit: Option<&'a str>,
    /// Raw config document as loaded, snapshotted for reproducibility.
    pub config: Option<&'a Value>,
    pub config_hash: Option<&'a str>,
    pub status: &'a str,
    pub run_health: Option<&'a str>,
    pub error: Option<&'a str>,
}

pub fn write_run_meta(path: &Path, meta: &RunMeta<'_>) -> std::io::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), json!(meta.run_id));
    payload.insert("started_at".to_string(), json!(meta.started_at));
    payload.insert("git_commit".to_string(), json!(meta.git_commit));
    payload.insert(
        "config".to_string(),
        meta.config.cloned().unwrap_or_else(|| json!({})),
    );
    payload.insert("config_hash".to_string(), json!(meta.config_hash));
    payload.insert("scanner_version".to_string(), json!(SCANNER_VERSION));
    payload.insert("spec_version".to_string(), json!(PIPELINE_SPEC_VERSION));
    payload.insert("status".to_string(), json!(meta.status));
    if let Some(health) = meta.run_health {
        payload.insert("run_health".to_string(), json!(health));
    }
    if let Some(error) = meta.error {
        payload.insert("error".to_string(), json!(error));
    }

    let text = serde_json::to_string_pretty(&Value::Object(payload))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let run_id = generate_run_id();
        let parts: Vec<&str> = run_id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert!(parts[1].ends_with('Z'));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_layout_seeds_metrics_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.finalize().unwrap();

        let layout = create_run_layout(dir.path(), "20260801_120000Z_abc123", &cfg).unwrap();
        assert!(layout.run_dir.ends_with("run_20260801_120000Z_abc123"));
        assert!(layout.log_path.as_ref().unwrap().exists());
        assert!(layout.metrics_path.exists());

        let metrics: Value =
            serde_json::from_str(&fs::read_to_string(&layout.metrics_path).unwrap()).unwrap();
        assert_eq!(metrics["requests_total"], json!(0));

        // Second create with the same id must fail (run dirs are immutable).
        assert!(create_run_layout(dir.path(), "20260801_120000Z_abc123", &cfg).is_err());
    }

    #[test]
    fn test_run_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_meta.json");
        let config = json!({"fees": {"maker_bps": 2.0}});
        write_run_meta(
            &path,
            &RunMeta {
                run_id: "r1",
                started_at: "2026-08-01T00:00:00Z",
                git_commit: Some("abc"),
                config: Some(&config),
                config_hash: Some("deadbeef"),
                status: "running",
                run_health: None,
                error: None,
            },
        )
        .unwrap();

        let payload: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(payload["run_id"], "r1");
        assert_eq!(payload["config"]["fees"]["maker_bps"], json!(2.0));
        assert_eq!(payload["status"], "running");
        assert!(payload.get("run_health").is_none());

        write_run_meta(
            &path,
            &RunMeta {
                run_id: "r1",
                started_at: "2026-08-01T00:00:00Z",
                git_commit: None,
                config: Some(&config),
                config_hash: Some("deadbeef"),
                status: "success",
                run_health: Some("degraded"),
                error: None,
            },
        )
        .unwrap();
        let payload: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(payload["status"], "success");
        assert_eq!(payload["run_health"], "degraded");
    }
}
