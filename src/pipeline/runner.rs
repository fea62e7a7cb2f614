//! Pipeline orchestrator.
//!
//! Walks the stage plan sequentially. For every stage: validate
//! preconditions, decide resume/skip, compute the effective deadline,
//! execute, classify timeouts (policy-gated partial success), validate
//! outputs, and persist the state transition before anything it
//! authorizes happens.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::config::{AppConfig, TimeoutBehavior};
use crate::io::layout::now_iso;
use crate::mexc::{MarketApi, MexcHttpError, MexcMetrics};
use crate::obs::metrics::{update_http_metrics, update_metrics};
use crate::obs::EventLogger;
use crate::pipeline::stages::{
    default_stage_definitions, ensure_stage_order, run_stage, validate_inputs, validate_outputs,
    validate_stage_names, StageContext, STAGE_ORDER,
};
use crate::pipeline::state::{
    PipelineState, StageError, StageStatus, StageUpdate, PIPELINE_SPEC_VERSION,
};
use crate::pipeline::universe::UniverseBuildError;
use crate::validation::ValidationMode;
use crate::SCANNER_VERSION;

pub const EXIT_OK: i32 = 0;
pub const EXIT_IO_ERROR: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_STAGE_ERROR: i32 = 3;
pub const EXIT_VALIDATION_ERROR: i32 = 4;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub resume: bool,
    pub force: bool,
    pub fail_fast: bool,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub artifact_validation: ValidationMode,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resume: true,
            force: false,
            fail_fast: true,
            continue_on_error: false,
            dry_run: false,
            artifact_validation: ValidationMode::Strict,
        }
    }
}

/// Explicit stage list wins over a `(from, to)` window; both fall back to
/// the full canonical order.
pub fn build_stage_plan(
    selected: Option<&[String]>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<String>, String> {
    if let Some(selected) = selected.filter(|list| !list.is_empty()) {
        let stages = validate_stage_names(selected)?;
        ensure_stage_order(&stages)?;
        return Ok(stages);
    }

    if from.is_some() || to.is_some() {
        if let Some(from) = from {
            if !STAGE_ORDER.contains(&from) {
                return Err(format!("Unknown --from stage: {from}"));
            }
        }
        if let Some(to) = to {
            if !STAGE_ORDER.contains(&to) {
                return Err(format!("Unknown --to stage: {to}"));
            }
        }
        let start = from
            .map(|name| STAGE_ORDER.iter().position(|s| *s == name).unwrap())
            .unwrap_or(0);
        let end = to
            .map(|name| STAGE_ORDER.iter().position(|s| *s == name).unwrap())
            .unwrap_or(STAGE_ORDER.len() - 1);
        if start > end {
            return Err("--from stage must be before --to stage".to_string());
        }
        return Ok(STAGE_ORDER[start..=end].iter().map(|s| s.to_string()).collect());
    }

    Ok(STAGE_ORDER.iter().map(|s| s.to_string()).collect())
}

/// Whether a timed-out stage produced enough data to be useful
/// downstream. Only the sampling stages can ever qualify.
fn has_minimum_data(name: &str, metrics: &Map<String, Value>, cfg: &AppConfig) -> bool {
    let get = |key: &str| metrics.get(key).and_then(Value::as_u64).unwrap_or(0);
    match name {
        "spread" => {
            let target = get("target_ticks");
            let floor = (target as f64 * cfg.sampling.spread.min_uptime).ceil() as u64;
            get("ticks_success") >= floor.max(1)
        }
        "depth" => get("ticks_success") >= 1,
        _ => false,
    }
}

fn classify_error(err: &anyhow::Error) -> (String, String) {
    if let Some(http) = err.downcast_ref::<MexcHttpError>() {
        return (http.kind().to_string(), http.to_string());
    }
    if let Some(universe) = err.downcast_ref::<UniverseBuildError>() {
        return ("UniverseBuildError".to_string(), universe.to_string());
    }
    ("StageError".to_string(), format!("{err:#}"))
}

pub struct RunPipelineArgs<'a> {
    pub run_dir: &'a Path,
    pub run_id: &'a str,
    pub config: &'a AppConfig,
    pub api: &'a dyn MarketApi,
    /// Client counters to roll into `metrics.json` after each stage.
    pub http_metrics: Option<Arc<MexcMetrics>>,
    pub events: &'a EventLogger,
    pub metrics_path: &'a Path,
    pub stage_plan: &'a [String],
    pub options: PipelineOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub exit_code: i32,
    /// Set when a stage finished as partial-success timeout.
    pub degraded: bool,
}

pub async fn run_pipeline(args: RunPipelineArgs<'_>) -> PipelineOutcome {
    let RunPipelineArgs {
        run_dir,
        run_id,
        config,
        api,
        http_metrics,
        events,
        metrics_path,
        stage_plan,
        options,
    } = args;

    let ok = |code: i32, degraded: bool| PipelineOutcome {
        exit_code: code,
        degraded,
    };

    if stage_plan.iter().any(|name| name == "score") && !config.sampling.raw.enabled {
        events.error(
            "config_invalid",
            "runner",
            "score stage requires sampling.raw.enabled=true",
            json!({}),
        );
        return ok(EXIT_CONFIG_ERROR, false);
    }

    let definitions = default_stage_definitions(config);
    let missing: Vec<&str> = stage_plan
        .iter()
        .map(String::as_str)
        .filter(|name| !definitions.iter().any(|def| def.name == *name))
        .collect();
    if !missing.is_empty() {
        events.error(
            "config_invalid",
            "runner",
            "Missing stage definitions",
            json!({"stages": missing}),
        );
        return ok(EXIT_CONFIG_ERROR, false);
    }

    let state_path = run_dir.join("pipeline_state.json");
    let mut state = if state_path.exists() {
        match PipelineState::load(&state_path, PIPELINE_SPEC_VERSION) {
            Ok(state) => state,
            Err(err) => {
                events.error("state_incompatible", "runner", &err.to_string(), json!({}));
                return ok(EXIT_VALIDATION_ERROR, false);
            }
        }
    } else {
        let specs: Vec<(String, Vec<String>, Vec<String>)> = definitions
            .iter()
            .map(|def| (def.name.to_string(), def.inputs.clone(), def.outputs.clone()))
            .collect();
        let state = PipelineState::create(run_id, SCANNER_VERSION, &specs);
        if let Err(err) = state.write(&state_path) {
            events.error("state_write_failed", "runner", &err.to_string(), json!({}));
            return ok(EXIT_IO_ERROR, false);
        }
        state
    };

    events.info(
        "pipeline_plan",
        "runner",
        "Pipeline plan built",
        json!({
            "stages": stage_plan,
            "resume": options.resume,
            "force": options.force,
            "dry_run": options.dry_run,
        }),
    );

    let make_ctx = |deadline: Option<Instant>| StageContext {
        run_dir,
        config,
        api,
        events,
        metrics_path,
        artifact_validation: options.artifact_validation,
        stage_deadline: deadline,
    };

    if options.dry_run {
        for name in stage_plan {
            let ctx = make_ctx(None);
            let mut errors = validate_inputs(name, &ctx);
            errors.extend(validate_outputs(name, &ctx));
            events.info(
                "stage_check",
                "runner",
                "Stage preconditions checked",
                json!({"stage": name, "ok": errors.is_empty(), "errors": errors}),
            );
        }
        return ok(EXIT_OK, false);
    }

    let run_deadline = (config.pipeline.total_timeout_s > 0)
        .then(|| Instant::now() + Duration::from_secs(config.pipeline.total_timeout_s));
    let grace = Duration::from_secs(config.pipeline.timeout_grace_s);

    let mut failed = false;
    let mut degraded = false;
    let mut exit_code = EXIT_OK;

    let flush_http = |name: &str, elapsed_ms: f64| {
        if let Some(metrics) = &http_metrics {
            update_http_metrics(metrics_path, &metrics.snapshot());
        }
        let gauge_key = format!("stage_{name}_duration_ms");
        update_metrics(metrics_path, &[], &[(gauge_key.as_str(), json!(elapsed_ms))]);
    };

    for name in stage_plan {
        let ctx = make_ctx(None);

        let input_errors = validate_inputs(name, &ctx);
        if !input_errors.is_empty() {
            state.set_stage(
                name,
                StageUpdate {
                    status: Some(StageStatus::Failed),
                    started_at: Some(now_iso()),
                    finished_at: Some(now_iso()),
                    error: Some(Some(StageError {
                        kind: "ArtifactValidationError".to_string(),
                        message: input_errors.join("; "),
                    })),
                    ..StageUpdate::default()
                },
            );
            let _ = state.write(&state_path);
            events.error(
                "stage_fail",
                "runner",
                "Stage preconditions failed",
                json!({"stage": name, "errors": input_errors}),
            );
            return ok(EXIT_VALIDATION_ERROR, degraded);
        }

        let previous_status = state.stage(name).map(|s| s.status);
        let output_errors = validate_outputs(name, &ctx);
        if options.resume
            && !options.force
            && output_errors.is_empty()
            && previous_status != Some(StageStatus::Timeout)
        {
            state.set_stage(
                name,
                StageUpdate {
                    status: Some(StageStatus::Skipped),
                    finished_at: Some(now_iso()),
                    metrics: Some(Map::new()),
                    ..StageUpdate::default()
                },
            );
            let _ = state.write(&state_path);
            update_metrics(metrics_path, &[("pipeline_stage_skipped_total", 1)], &[]);
            events.info("stage_skip", "runner", "Stage skipped", json!({"stage": name}));
            continue;
        }

        state.set_stage(
            name,
            StageUpdate {
                status: Some(StageStatus::Running),
                started_at: Some(now_iso()),
                error: Some(None),
                ..StageUpdate::default()
            },
        );
        let _ = state.write(&state_path);
        events.info("stage_start", "runner", "Stage started", json!({"stage": name}));

        // Effective deadline: the earlier of stage timeout and run
        // deadline. The body gets deadline + grace; the post-hoc check
        // uses the raw deadline.
        let stage_timeout_s = config
            .pipeline
            .stage_timeouts_s
            .get(name.as_str())
            .copied()
            .unwrap_or(0);
        let stage_deadline =
            (stage_timeout_s > 0).then(|| Instant::now() + Duration::from_secs(stage_timeout_s));
        let deadline = match (stage_deadline, run_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let start = Instant::now();
        let body_ctx = make_ctx(deadline.map(|d| d + grace));
        let result = run_stage(name, &body_ctx).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        flush_http(name, duration_ms);

        let mut metrics = match result {
            Ok(metrics) => metrics,
            Err(err) => {
                let (kind, message) = classify_error(&err);
                let mut failure_metrics = Map::new();
                failure_metrics.insert("duration_ms".into(), json!(duration_ms));
                state.set_stage(
                    name,
                    StageUpdate {
                        status: Some(StageStatus::Failed),
                        finished_at: Some(now_iso()),
                        metrics: Some(failure_metrics),
                        error: Some(Some(StageError {
                            kind: kind.clone(),
                            message: message.clone(),
                        })),
                        ..StageUpdate::default()
                    },
                );
                let _ = state.write(&state_path);
                update_metrics(metrics_path, &[("pipeline_stage_failed_total", 1)], &[]);
                events.error(
                    "stage_fail",
                    "runner",
                    "Stage failed",
                    json!({
                        "stage": name,
                        "duration_ms": duration_ms,
                        "error_type": kind,
                        "error": message,
                    }),
                );
                failed = true;
                exit_code = exit_code.max(EXIT_STAGE_ERROR);
                if options.continue_on_error || !options.fail_fast {
                    continue;
                }
                return ok(EXIT_STAGE_ERROR, degraded);
            }
        };
        metrics.insert("duration_ms".into(), json!(duration_ms));

        let timed_out_flag = metrics
            .get("timed_out")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let deadline_exceeded =
            timed_out_flag || deadline.map(|d| Instant::now() > d).unwrap_or(false);

        if deadline_exceeded {
            let check_ctx = make_ctx(None);
            let output_errors = validate_outputs(name, &check_ctx);
            let partial_ok = config.pipeline.timeout_behavior == TimeoutBehavior::PartialSuccess
                && output_errors.is_empty()
                && has_minimum_data(name, &metrics, config);

            if partial_ok {
                state.set_stage(
                    name,
                    StageUpdate {
                        status: Some(StageStatus::Timeout),
                        finished_at: Some(now_iso()),
                        metrics: Some(metrics),
                        error: Some(None),
                        ..StageUpdate::default()
                    },
                );
                let _ = state.write(&state_path);
                degraded = true;
                update_metrics(
                    metrics_path,
                    &[("pipeline_stage_timeout_total", 1)],
                    &[("run_degraded", json!(1))],
                );
                events.warn(
                    "stage_timeout",
                    "runner",
                    "Stage exceeded its deadline but kept enough data; continuing",
                    json!({"stage": name, "duration_ms": duration_ms}),
                );
                continue;
            }

            state.set_stage(
                name,
                StageUpdate {
                    status: Some(StageStatus::Failed),
                    finished_at: Some(now_iso()),
                    metrics: Some(metrics),
                    error: Some(Some(StageError {
                        kind: "StageTimeoutError".to_string(),
                        message: format!("Stage {name} exceeded its deadline"),
                    })),
                    ..StageUpdate::default()
                },
            );
            let _ = state.write(&state_path);
            update_metrics(metrics_path, &[("pipeline_stage_failed_total", 1)], &[]);
            events.error(
                "stage_fail",
                "runner",
                "Stage timed out",
                json!({"stage": name, "duration_ms": duration_ms, "errors": output_errors}),
            );
            failed = true;
            exit_code = exit_code.max(EXIT_STAGE_ERROR);
            if options.continue_on_error || !options.fail_fast {
                continue;
            }
            return ok(EXIT_STAGE_ERROR, degraded);
        }

        let check_ctx = make_ctx(None);
        let output_errors = validate_outputs(name, &check_ctx);
        if !output_errors.is_empty() {
            state.set_stage(
                name,
                StageUpdate {
                    status: Some(StageStatus::Failed),
                    finished_at: Some(now_iso()),
                    metrics: Some(metrics),
                    error: Some(Some(StageError {
                        kind: "ArtifactValidationError".to_string(),
                        message: output_errors.join("; "),
                    })),
                    ..StageUpdate::default()
                },
            );
            let _ = state.write(&state_path);
            update_metrics(metrics_path, &[("pipeline_stage_failed_total", 1)], &[]);
            events.error(
                "stage_fail",
                "runner",
                "Stage outputs invalid",
                json!({"stage": name, "duration_ms": duration_ms, "errors": output_errors}),
            );
            failed = true;
            exit_code = exit_code.max(EXIT_VALIDATION_ERROR);
            if options.continue_on_error || !options.fail_fast {
                continue;
            }
            return ok(EXIT_VALIDATION_ERROR, degraded);
        }

        let outputs = definitions
            .iter()
            .find(|def| def.name == name)
            .map(|def| def.outputs.clone())
            .unwrap_or_default();
        state.set_stage(
            name,
            StageUpdate {
                status: Some(StageStatus::Success),
                finished_at: Some(now_iso()),
                metrics: Some(metrics),
                error: Some(None),
                ..StageUpdate::default()
            },
        );
        let _ = state.write(&state_path);
        update_metrics(metrics_path, &[("pipeline_stage_success_total", 1)], &[]);
        events.info(
            "stage_success",
            "runner",
            "Stage finished",
            json!({"stage": name, "duration_ms": duration_ms, "outputs": outputs}),
        );
    }

    if failed && exit_code == EXIT_OK {
        exit_code = EXIT_STAGE_ERROR;
    }

    events.info(
        "pipeline_done",
        "runner",
        "Pipeline completed",
        json!({"failed": failed, "exit_code": exit_code, "degraded": degraded}),
    );

    ok(exit_code, degraded)
}
