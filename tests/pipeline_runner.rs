//! End-to-end pipeline runs against a scripted exchange double.

mod common;

use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use common::MockApi;
use spreadscan::config::AppConfig;
use spreadscan::io::layout::{now_iso, write_run_meta, RunMeta};
use spreadscan::obs::EventLogger;
use spreadscan::pipeline::runner::{
    build_stage_plan, run_pipeline, PipelineOptions, RunPipelineArgs, EXIT_OK,
    EXIT_VALIDATION_ERROR,
};
use spreadscan::pipeline::state::PIPELINE_SPEC_VERSION;

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sampling.spread.duration_s = 3;
    cfg.sampling.spread.interval_s = 1.0;
    cfg.sampling.depth.duration_s = 2;
    cfg.sampling.depth.interval_s = 1.0;
    cfg.mexc.max_rps = 1000.0;
    cfg.finalize().unwrap();
    cfg
}

fn seed_run_meta(run_dir: &Path, run_id: &str) {
    let config_snapshot = json!({});
    write_run_meta(
        &run_dir.join("run_meta.json"),
        &RunMeta {
            run_id,
            started_at: &now_iso(),
            git_commit: None,
            config: Some(&config_snapshot),
            config_hash: Some("test"),
            status: "running",
            run_health: None,
            error: None,
        },
    )
    .unwrap();
}

fn load_state(run_dir: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(run_dir.join("pipeline_state.json")).unwrap()).unwrap()
}

fn stage_status(state: &Value, name: &str) -> String {
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

async fn execute(
    run_dir: &Path,
    api: &MockApi,
    cfg: &AppConfig,
    options: PipelineOptions,
) -> spreadscan::pipeline::runner::PipelineOutcome {
    let plan = build_stage_plan(None, None, None).unwrap();
    run_pipeline(RunPipelineArgs {
        run_dir,
        run_id: "run_itest",
        config: cfg,
        api,
        http_metrics: None,
        events: &EventLogger::disabled(),
        metrics_path: &run_dir.join("metrics.json"),
        stage_plan: &plan,
        options,
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_full_run_produces_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    seed_run_meta(run_dir, "run_itest");

    let api = MockApi::healthy(&["AAAUSDT", "BBBUSDT"]);
    let cfg = test_config();
    let outcome = execute(run_dir, &api, &cfg, PipelineOptions::default()).await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    assert!(!outcome.degraded);

    for artifact in [
        "universe.json",
        "universe_rejects.csv",
        "raw_bookticker.jsonl.gz",
        "summary.csv",
        "summary.json",
        "depth_metrics.csv",
        "summary_enriched.csv",
        "report.md",
        "shortlist.csv",
        "pipeline_state.json",
        "metrics.json",
    ] {
        assert!(run_dir.join(artifact).exists(), "missing {artifact}");
    }

    let state = load_state(run_dir);
    assert_eq!(state["spec_version"], PIPELINE_SPEC_VERSION);
    for stage in ["universe", "spread", "score", "depth", "report"] {
        assert_eq!(stage_status(&state, stage), "success", "stage {stage}");
    }

    // Both symbols pass everything; the shortlist carries them in order.
    let shortlist = fs::read_to_string(run_dir.join("shortlist.csv")).unwrap();
    let rows: Vec<&str> = shortlist.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.ends_with("true")));

    let enriched = fs::read_to_string(run_dir.join("summary_enriched.csv")).unwrap();
    assert!(enriched.lines().skip(1).all(|row| row.contains(",true")));
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_everything_and_keeps_artifacts_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    seed_run_meta(run_dir, "run_itest");

    let api = MockApi::healthy(&["AAAUSDT", "BBBUSDT"]);
    let cfg = test_config();
    let outcome = execute(run_dir, &api, &cfg, PipelineOptions::default()).await;
    assert_eq!(outcome.exit_code, EXIT_OK);

    let calls_after_first = api.call_count();
    assert!(calls_after_first > 0);
    let summary_before = fs::read(run_dir.join("summary.csv")).unwrap();
    let shortlist_before = fs::read(run_dir.join("shortlist.csv")).unwrap();

    let outcome = execute(run_dir, &api, &cfg, PipelineOptions::default()).await;
    assert_eq!(outcome.exit_code, EXIT_OK);

    // No HTTP traffic on resume; every stage is recorded as skipped.
    assert_eq!(api.call_count(), calls_after_first);
    let state = load_state(run_dir);
    for stage in ["universe", "spread", "score", "depth", "report"] {
        assert_eq!(stage_status(&state, stage), "skipped", "stage {stage}");
    }

    assert_eq!(fs::read(run_dir.join("summary.csv")).unwrap(), summary_before);
    assert_eq!(fs::read(run_dir.join("shortlist.csv")).unwrap(), shortlist_before);

    let metrics: Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("metrics.json")).unwrap()).unwrap();
    assert_eq!(metrics["pipeline_stage_skipped_total"], json!(5));
}

#[tokio::test(start_paused = true)]
async fn test_force_reruns_despite_valid_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    seed_run_meta(run_dir, "run_itest");

    let api = MockApi::healthy(&["AAAUSDT", "BBBUSDT"]);
    let cfg = test_config();
    execute(run_dir, &api, &cfg, PipelineOptions::default()).await;
    let calls_after_first = api.call_count();

    let outcome = execute(
        run_dir,
        &api,
        &cfg,
        PipelineOptions {
            force: true,
            ..PipelineOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    assert!(api.call_count() > calls_after_first);

    let state = load_state(run_dir);
    assert_eq!(stage_status(&state, "spread"), "success");
}

#[tokio::test(start_paused = true)]
async fn test_missing_inputs_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();

    let api = MockApi::healthy(&["AAAUSDT"]);
    let cfg = test_config();
    // Score without universe/spread artifacts must fail preconditions.
    let plan = vec!["score".to_string()];
    let outcome = run_pipeline(RunPipelineArgs {
        run_dir,
        run_id: "run_itest",
        config: &cfg,
        api: &api,
        http_metrics: None,
        events: &EventLogger::disabled(),
        metrics_path: &run_dir.join("metrics.json"),
        stage_plan: &plan,
        options: PipelineOptions::default(),
    })
    .await;

    assert_eq!(outcome.exit_code, EXIT_VALIDATION_ERROR);
    assert_eq!(api.call_count(), 0);
    let state = load_state(run_dir);
    assert_eq!(stage_status(&state, "score"), "failed");
    let score = state["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|stage| stage["name"] == "score")
        .unwrap();
    assert_eq!(score["error"]["type"], "ArtifactValidationError");
}

#[tokio::test(start_paused = true)]
async fn test_spec_version_mismatch_refuses_resume() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();
    seed_run_meta(run_dir, "run_itest");

    let api = MockApi::healthy(&["AAAUSDT"]);
    let cfg = test_config();
    execute(run_dir, &api, &cfg, PipelineOptions::default()).await;

    // Rewrite the durable state with a stale spec version.
    let state_path = run_dir.join("pipeline_state.json");
    let mut state: Value = serde_json::from_str(&fs::read_to_string(&state_path).unwrap()).unwrap();
    state["spec_version"] = json!("0.0-ancient");
    fs::write(&state_path, serde_json::to_string_pretty(&state).unwrap()).unwrap();

    let outcome = execute(run_dir, &api, &cfg, PipelineOptions::default()).await;
    assert_eq!(outcome.exit_code, EXIT_VALIDATION_ERROR);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_issues_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path();

    let api = MockApi::healthy(&["AAAUSDT"]);
    let cfg = test_config();
    let outcome = execute(
        run_dir,
        &api,
        &cfg,
        PipelineOptions {
            dry_run: true,
            ..PipelineOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.exit_code, EXIT_OK);
    assert_eq!(api.call_count(), 0);
    // No artifacts beyond the state file appear during a dry run.
    assert!(!run_dir.join("universe.json").exists());
}
