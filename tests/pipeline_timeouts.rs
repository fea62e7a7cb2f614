//! Deadline propagation and timeout classification.

mod common;

use std::fs;
use std::path::Path;

use serde_json::Value;

use common::MockApi;
use spreadscan::config::{AppConfig, TimeoutBehavior};
use spreadscan::obs::EventLogger;
use spreadscan::pipeline::runner::{
    build_stage_plan, run_pipeline, PipelineOptions, PipelineOutcome, RunPipelineArgs, EXIT_OK,
    EXIT_STAGE_ERROR,
};

fn timeout_config(behavior: TimeoutBehavior, min_uptime: f64) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sampling.spread.duration_s = 10;
    cfg.sampling.spread.interval_s = 1.0;
    cfg.sampling.spread.min_uptime = min_uptime;
    cfg.pipeline
        .stage_timeouts_s
        .insert("spread".to_string(), 5);
    cfg.pipeline.timeout_grace_s = 2;
    cfg.pipeline.timeout_behavior = behavior;
    cfg.mexc.max_rps = 1000.0;
    cfg.finalize().unwrap();
    cfg
}

fn stage_status(run_dir: &Path, name: &str) -> String {
    let state: Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("pipeline_state.json")).unwrap())
            .unwrap();
    state["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|stage| stage["name"] == name)
        .unwrap()["status"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn execute(run_dir: &Path, api: &MockApi, cfg: &AppConfig) -> PipelineOutcome {
    let plan = build_stage_plan(Some(&["universe".to_string(), "spread".to_string()]), None, None)
        .unwrap();
    run_pipeline(RunPipelineArgs {
        run_dir,
        run_id: "run_timeout",
        config: cfg,
        api,
        http_metrics: None,
        events: &EventLogger::disabled(),
        metrics_path: &run_dir.join("metrics.json"),
        stage_plan: &plan,
        options: PipelineOptions::default(),
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_partial_success_records_timeout_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    let api = MockApi::healthy(&["AAAUSDT"]);
    // 10 target ticks, 5s stage timeout + 2s grace: ~7 ticks land, and
    // ceil(10 * 0.5) = 5 is enough for partial success.
    let cfg = timeout_config(TimeoutBehavior::PartialSuccess, 0.5);

    let outcome = execute(run_dir, &api, &cfg).await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    assert!(outcome.degraded);

    assert_eq!(stage_status(run_dir, "universe"), "success");
    assert_eq!(stage_status(run_dir, "spread"), "timeout");

    let metrics: Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("metrics.json")).unwrap()).unwrap();
    assert_eq!(metrics["pipeline_stage_timeout_total"], 1);
    assert_eq!(metrics["run_degraded"], 1);

    // The partial raw file survives and carries the completed ticks.
    let raw = run_dir.join("raw_bookticker.jsonl.gz");
    assert!(raw.exists());
    assert!(raw.metadata().unwrap().len() > 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_policy_fail_marks_stage_failed() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    let api = MockApi::healthy(&["AAAUSDT"]);
    let cfg = timeout_config(TimeoutBehavior::Fail, 0.5);

    let outcome = execute(run_dir, &api, &cfg).await;
    assert_eq!(outcome.exit_code, EXIT_STAGE_ERROR);
    assert!(!outcome.degraded);
    assert_eq!(stage_status(run_dir, "spread"), "failed");

    let state: Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("pipeline_state.json")).unwrap())
            .unwrap();
    let spread = state["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|stage| stage["name"] == "spread")
        .unwrap();
    assert_eq!(spread["error"]["type"], "StageTimeoutError");
}

#[tokio::test(start_paused = true)]
async fn test_partial_success_requires_minimum_data() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    let api = MockApi::healthy(&["AAAUSDT"]);
    // ceil(10 * 0.9) = 9 completed ticks required, only ~7 fit: no partial
    // success even under the lenient policy.
    let cfg = timeout_config(TimeoutBehavior::PartialSuccess, 0.9);

    let outcome = execute(run_dir, &api, &cfg).await;
    assert_eq!(outcome.exit_code, EXIT_STAGE_ERROR);
    assert_eq!(stage_status(run_dir, "spread"), "failed");
}

#[tokio::test(start_paused = true)]
async fn test_resume_never_skips_a_timed_out_stage() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    let api = MockApi::healthy(&["AAAUSDT"]);
    let cfg = timeout_config(TimeoutBehavior::PartialSuccess, 0.5);

    let outcome = execute(run_dir, &api, &cfg).await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    let calls_after_first = api.call_count();

    // Resume re-executes spread (its previous status is timeout), while
    // universe is skipped.
    let outcome = execute(run_dir, &api, &cfg).await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    assert!(outcome.degraded);
    assert!(api.call_count() > calls_after_first);
    assert_eq!(stage_status(run_dir, "universe"), "skipped");
    assert_eq!(stage_status(run_dir, "spread"), "timeout");
}
