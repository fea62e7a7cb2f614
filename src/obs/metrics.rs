//! Process-wide counters persisted to `metrics.json`.
//!
//! Updates are read-modify-write with a full-file atomic replace (write to
//! temp, rename) so a crash between stages never leaves partial JSON
//! behind. The orchestrator is the sole mutator.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::mexc::HttpMetricsSnapshot;

/// Upper bounds of the latency histogram, milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [25, 50, 100, 250, 500, 1000, 2000, 5000];

pub fn read_metrics(path: &Path) -> Map<String, Value> {
    let Ok(text) = fs::read_to_string(path) else {
        return Map::new();
    };
    if text.trim().is_empty() {
        return Map::new();
    }
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

fn write_metrics(path: &Path, payload: &Map<String, Value>) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(&Value::Object(payload.clone()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

/// Add counter increments and overwrite gauges.
pub fn update_metrics(path: &Path, increments: &[(&str, i64)], gauges: &[(&str, Value)]) {
    let mut payload = read_metrics(path);
    for (key, delta) in increments {
        let current = payload.get(*key).and_then(Value::as_i64).unwrap_or(0);
        payload.insert((*key).to_string(), json!(current + delta));
    }
    for (key, value) in gauges {
        payload.insert((*key).to_string(), value.clone());
    }
    let _ = write_metrics(path, &payload);
}

/// Roll the client's request/retry/latency counters into the aggregate.
pub fn update_http_metrics(path: &Path, snapshot: &HttpMetricsSnapshot) {
    let mut payload = read_metrics(path);

    let requests_total: u64 = snapshot.requests_total.values().sum();
    let retries_total: u64 = snapshot.retries_total.values().sum();

    let mut requests_by_status: Map<String, Value> = Map::new();
    let mut errors_total = 0u64;
    let mut http_429_total = 0u64;
    let mut http_403_total = 0u64;
    let mut http_5xx_total = 0u64;
    for ((_endpoint, status), count) in &snapshot.requests_total {
        let current = requests_by_status
            .get(status)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        requests_by_status.insert(status.clone(), json!(current + count));
        match status.parse::<u16>() {
            Ok(code) => {
                if !(200..300).contains(&code) {
                    errors_total += count;
                }
                if code == 429 {
                    http_429_total += count;
                }
                if code == 403 {
                    http_403_total += count;
                }
                if (500..600).contains(&code) {
                    http_5xx_total += count;
                }
            }
            // timeout / connection_error labels
            Err(_) => errors_total += count,
        }
    }

    let latencies: Vec<f64> = snapshot.latency_ms.values().flatten().copied().collect();
    let mut buckets: Map<String, Value> = Map::new();
    for bound in LATENCY_BUCKETS_MS {
        let count = latencies.iter().filter(|v| **v <= bound as f64).count();
        buckets.insert(bound.to_string(), json!(count));
    }
    buckets.insert("+inf".to_string(), json!(latencies.len()));

    let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    payload.insert("requests_total".to_string(), json!(requests_total));
    payload.insert("errors_total".to_string(), json!(errors_total));
    payload.insert("retries_total".to_string(), json!(retries_total));
    payload.insert("requests_by_status".to_string(), Value::Object(requests_by_status));
    payload.insert("http_429_total".to_string(), json!(http_429_total));
    payload.insert("http_403_total".to_string(), json!(http_403_total));
    payload.insert("http_5xx_total".to_string(), json!(http_5xx_total));
    payload.insert(
        "latency_ms".to_string(),
        json!({
            "count": latencies.len(),
            "min": if latencies.is_empty() { Value::Null } else { json!(min) },
            "max": if latencies.is_empty() { Value::Null } else { json!(max) },
            "buckets": Value::Object(buckets),
        }),
    );

    let _ = write_metrics(path, &payload);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiHealth {
    pub run_health: &'static str,
    pub http_429_total: u64,
    pub http_403_total: u64,
    pub http_5xx_total: u64,
    pub run_degraded: u64,
}

/// Derive run health from the metrics aggregate: any 5xx means the API was
/// unstable; 429/403 or an explicit degraded flag means degraded.
pub fn summarize_api_health(payload: &Map<String, Value>) -> ApiHealth {
    let get = |key: &str| payload.get(key).and_then(Value::as_u64).unwrap_or(0);
    let http_429_total = get("http_429_total");
    let http_403_total = get("http_403_total");
    let http_5xx_total = get("http_5xx_total");
    let run_degraded = get("run_degraded");

    let run_health = if http_5xx_total > 0 {
        "api_unstable"
    } else if http_429_total > 0 || http_403_total > 0 || run_degraded > 0 {
        "degraded"
    } else {
        "ok"
    };

    ApiHealth {
        run_health,
        http_429_total,
        http_403_total,
        http_5xx_total,
        run_degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_update_metrics_increments_and_gauges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        update_metrics(&path, &[("pipeline_stage_success_total", 1)], &[]);
        update_metrics(
            &path,
            &[("pipeline_stage_success_total", 2)],
            &[("shortlist_size", json!(7))],
        );

        let payload = read_metrics(&path);
        assert_eq!(payload["pipeline_stage_success_total"], json!(3));
        assert_eq!(payload["shortlist_size"], json!(7));
        // No stray temp file left behind.
        assert!(!dir.path().join("metrics.json.tmp").exists());
    }

    #[test]
    fn test_http_rollup_and_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let mut requests: HashMap<(String, String), u64> = HashMap::new();
        requests.insert(("/api/v3/ticker/bookTicker".into(), "200".into()), 10);
        requests.insert(("/api/v3/ticker/bookTicker".into(), "429".into()), 2);
        requests.insert(("/api/v3/depth".into(), "503".into()), 1);
        requests.insert(("/api/v3/depth".into(), "timeout".into()), 1);
        let mut retries: HashMap<(String, String), u64> = HashMap::new();
        retries.insert(("/api/v3/ticker/bookTicker".into(), "rate_limited".into()), 2);
        let mut latency: HashMap<String, Vec<f64>> = HashMap::new();
        latency.insert("/api/v3/depth".into(), vec![10.0, 80.0, 6000.0]);

        update_http_metrics(
            &path,
            &HttpMetricsSnapshot {
                requests_total: requests,
                retries_total: retries,
                latency_ms: latency,
            },
        );

        let payload = read_metrics(&path);
        assert_eq!(payload["requests_total"], json!(14));
        assert_eq!(payload["retries_total"], json!(2));
        assert_eq!(payload["errors_total"], json!(4));
        assert_eq!(payload["http_429_total"], json!(2));
        assert_eq!(payload["http_5xx_total"], json!(1));
        assert_eq!(payload["latency_ms"]["buckets"]["25"], json!(1));
        assert_eq!(payload["latency_ms"]["buckets"]["100"], json!(2));
        assert_eq!(payload["latency_ms"]["buckets"]["+inf"], json!(3));
    }

    #[test]
    fn test_health_derivation() {
        let mut payload = Map::new();
        assert_eq!(summarize_api_health(&payload).run_health, "ok");

        payload.insert("http_429_total".into(), json!(1));
        assert_eq!(summarize_api_health(&payload).run_health, "degraded");

        payload.insert("http_5xx_total".into(), json!(1));
        assert_eq!(summarize_api_health(&payload).run_health, "api_unstable");

        let mut degraded_only = Map::new();
        degraded_only.insert("run_degraded".into(), json!(1));
        assert_eq!(summarize_api_health(&degraded_only).run_health, "degraded");
    }
}
