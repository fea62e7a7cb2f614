//! Durable per-run pipeline state.
//!
//! `pipeline_state.json` is rewritten after every status transition with a
//! full-file atomic replace, and re-read on resume. A spec-version bump
//! makes older state unreadable on purpose: the run engine refuses to
//! resume it.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::io::layout::now_iso;

/// Bumped whenever the artifact contract changes incompatibly.
pub const PIPELINE_SPEC_VERSION: &str = "0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Skipped,
    Timeout,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub error: Option<StageError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: String,
    pub scanner_version: String,
    pub spec_version: String,
    pub stages: Vec<StageRecord>,
    pub updated_at: String,
}

#[derive(Debug)]
pub enum StateError {
    SpecVersionMismatch { found: String, expected: String },
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpecVersionMismatch { found, expected } => write!(
                f,
                "pipeline_state spec_version mismatch: {found} != {expected}"
            ),
            Self::Io(err) => write!(f, "pipeline_state io error: {err}"),
            Self::Json(err) => write!(f, "pipeline_state parse error: {err}"),
        }
    }
}

impl std::error::Error for StateError {}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// Mutation applied to a single stage record; unset fields keep their
/// previous value so timestamps survive resume-skip transitions.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub status: Option<StageStatus>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub metrics: Option<Map<String, Value>>,
    pub error: Option<Option<StageError>>,
}

impl PipelineState {
    pub fn create(
        run_id: &str,
        scanner_version: &str,
        stages: &[(String, Vec<String>, Vec<String>)],
    ) -> Self {
        let records = stages
            .iter()
            .map(|(name, inputs, outputs)| StageRecord {
                name: name.clone(),
                status: StageStatus::Pending,
                started_at: None,
                finished_at: None,
                inputs: inputs.clone(),
                outputs: outputs.clone(),
                metrics: Map::new(),
                error: None,
            })
            .collect();
        Self {
            run_id: run_id.to_string(),
            scanner_version: scanner_version.to_string(),
            spec_version: PIPELINE_SPEC_VERSION.to_string(),
            stages: records,
            updated_at: now_iso(),
        }
    }

    pub fn load(path: &Path, expected_spec: &str) -> Result<Self, StateError> {
        let text = fs::read_to_string(path)?;
        let state: PipelineState = serde_json::from_str(&text)?;
        if state.spec_version != expected_spec {
            return Err(StateError::SpecVersionMismatch {
                found: state.spec_version,
                expected: expected_spec.to_string(),
            });
        }
        Ok(state)
    }

    /// Full-file overwrite via temp + rename; no partial JSON is ever
    /// observable.
    pub fn write(&self, path: &Path) -> Result<(), StateError> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn set_stage(&mut self, name: &str, update: StageUpdate) {
        if let Some(stage) = self.stages.iter_mut().find(|stage| stage.name == name) {
            if let Some(status) = update.status {
                stage.status = status;
            }
            if let Some(started_at) = update.started_at {
                stage.started_at = Some(started_at);
            }
            if let Some(finished_at) = update.finished_at {
                stage.finished_at = Some(finished_at);
            }
            if let Some(metrics) = update.metrics {
                stage.metrics = metrics;
            }
            if let Some(error) = update.error {
                stage.error = error;
            }
        }
        self.updated_at = now_iso();
    }
}
