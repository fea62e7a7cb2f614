//! YAML configuration model.
//!
//! Unknown keys are rejected so a typo'd threshold cannot silently fall
//! back to a default. Stage timeout defaults are derived from the sampling
//! durations after load.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::validation::ValidationMode;

/// Raised when configuration cannot be loaded or validated.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MexcConfig {
    pub base_url: String,
    pub timeout_s: f64,
    pub max_retries: u32,
    pub backoff_base_s: f64,
    pub backoff_max_s: f64,
    pub max_rps: f64,
}

impl Default for MexcConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mexc.com".to_string(),
            timeout_s: 10.0,
            max_retries: 5,
            backoff_base_s: 0.5,
            backoff_max_s: 8.0,
            max_rps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    pub run_name: Option<String>,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_name: None,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObsConfig {
    pub log_jsonl: bool,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self { log_jsonl: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UniverseConfig {
    pub quote_asset: String,
    pub allowed_exchange_status: Vec<String>,
    pub min_quote_volume_24h: f64,
    pub min_trades_24h: i64,
    pub use_quote_volume_estimate: bool,
    pub require_trade_count: bool,
    pub blacklist_regex: Vec<String>,
    pub whitelist: Vec<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            // Upstream has used both the numeric and symbolic spelling.
            allowed_exchange_status: vec!["1".to_string(), "TRADING".to_string()],
            min_quote_volume_24h: 100_000.0,
            min_trades_24h: 200,
            use_quote_volume_estimate: true,
            require_trade_count: false,
            blacklist_regex: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpreadSamplingConfig {
    pub duration_s: u64,
    pub interval_s: f64,
    pub min_uptime: f64,
    pub allow_per_symbol: bool,
    pub per_symbol_limit: usize,
}

impl Default for SpreadSamplingConfig {
    fn default() -> Self {
        Self {
            duration_s: 1800,
            interval_s: 5.0,
            min_uptime: 0.9,
            allow_per_symbol: false,
            per_symbol_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DepthSamplingConfig {
    pub duration_s: u64,
    pub interval_s: f64,
    pub limit: u32,
}

impl Default for DepthSamplingConfig {
    fn default() -> Self {
        Self {
            duration_s: 1200,
            interval_s: 30.0,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawSamplingConfig {
    pub enabled: bool,
    pub gzip: bool,
}

impl Default for RawSamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gzip: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SamplingConfig {
    pub spread: SpreadSamplingConfig,
    pub depth: DepthSamplingConfig,
    pub raw: RawSamplingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FeesConfig {
    pub taker_bps: f64,
    pub maker_bps: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            taker_bps: 4.0,
            maker_bps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpreadThresholdsConfig {
    pub median_min_bps: f64,
    pub median_max_bps: f64,
    pub p90_min_bps: f64,
    pub p90_max_bps: f64,
}

impl Default for SpreadThresholdsConfig {
    fn default() -> Self {
        Self {
            median_min_bps: 0.0,
            median_max_bps: 25.0,
            p90_min_bps: 0.0,
            p90_max_bps: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DepthThresholdsConfig {
    pub best_level_min_notional: f64,
    pub unwind_slippage_max_bps: f64,
    pub band_10bps_min_notional: f64,
    pub topn_min_notional: f64,
}

impl Default for DepthThresholdsConfig {
    fn default() -> Self {
        Self {
            best_level_min_notional: 100.0,
            unwind_slippage_max_bps: 50.0,
            band_10bps_min_notional: 50.0,
            topn_min_notional: 500.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThresholdsConfig {
    pub spread: SpreadThresholdsConfig,
    pub depth: DepthThresholdsConfig,
    pub uptime_min: f64,
    pub edge_min_bps: f64,
    pub slippage_buffer_bps: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            spread: SpreadThresholdsConfig::default(),
            depth: DepthThresholdsConfig::default(),
            uptime_min: 0.9,
            edge_min_bps: 2.0,
            slippage_buffer_bps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DepthConfig {
    pub top_n_levels: usize,
    pub band_bps: Vec<u32>,
    pub stress_notional_usdt: f64,
    pub candidates_limit: usize,
    pub enable_band_checks: bool,
    pub enable_topn_checks: bool,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            top_n_levels: 10,
            band_bps: vec![5, 10, 20],
            stress_notional_usdt: 100.0,
            candidates_limit: 50,
            enable_band_checks: false,
            enable_topn_checks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReportConfig {
    pub top_n: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { top_n: 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    Fail,
    PartialSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadTimeoutBehavior {
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub resume: bool,
    pub fail_fast: bool,
    pub continue_on_error: bool,
    pub artifact_validation: ValidationMode,
    /// 0 disables the per-run deadline.
    pub total_timeout_s: u64,
    /// Per-stage timeouts in seconds; 0 disables. Missing stages get
    /// derived defaults after load.
    pub stage_timeouts_s: BTreeMap<String, u64>,
    pub timeout_behavior: TimeoutBehavior,
    pub timeout_grace_s: u64,
    pub safety_margin_s: u64,
    pub spread_timeout_behavior: SpreadTimeoutBehavior,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resume: true,
            fail_fast: true,
            continue_on_error: false,
            artifact_validation: ValidationMode::Strict,
            total_timeout_s: 0,
            stage_timeouts_s: BTreeMap::new(),
            timeout_behavior: TimeoutBehavior::Fail,
            timeout_grace_s: 2,
            safety_margin_s: 5,
            spread_timeout_behavior: SpreadTimeoutBehavior::Warn,
        }
    }
}

// =============================================================================
// ROOT
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub mexc: MexcConfig,
    pub runtime: RuntimeConfig,
    pub obs: ObsConfig,
    pub universe: UniverseConfig,
    pub sampling: SamplingConfig,
    pub thresholds: ThresholdsConfig,
    pub fees: FeesConfig,
    pub depth: DepthConfig,
    pub report: ReportConfig,
    pub pipeline: PipelineConfig,
}

/// Config plus the raw document it was parsed from (snapshotted into
/// `run_meta.json`).
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub raw: serde_json::Value,
}

const STAGE_TIMEOUT_KEYS: [&str; 5] = ["universe", "spread", "score", "depth", "report"];

impl AppConfig {
    pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|_| ConfigError(format!("Config not found: {}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<LoadedConfig, ConfigError> {
        let raw: serde_json::Value = if text.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_yaml::from_str(text).map_err(|err| ConfigError(format!("Invalid YAML: {err}")))?
        };
        if !raw.is_object() {
            return Err(ConfigError("Config root must be a mapping".to_string()));
        }

        let mut config: AppConfig = serde_json::from_value(raw.clone())
            .map_err(|err| ConfigError(err.to_string()))?;
        config.finalize()?;
        Ok(LoadedConfig { config, raw })
    }

    /// Apply derived stage-timeout defaults and run cross-field checks.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.mexc.max_rps <= 0.0 {
            return Err(ConfigError("mexc.max_rps must be positive".to_string()));
        }
        if self.sampling.spread.interval_s <= 0.0 || self.sampling.depth.interval_s <= 0.0 {
            return Err(ConfigError("sampling interval_s must be positive".to_string()));
        }
        if self.sampling.spread.duration_s == 0 || self.sampling.depth.duration_s == 0 {
            return Err(ConfigError("sampling duration_s must be positive".to_string()));
        }
        if self.sampling.depth.limit == 0 || self.sampling.depth.limit > 5000 {
            return Err(ConfigError(
                "sampling.depth.limit must be between 1 and 5000".to_string(),
            ));
        }
        if self.depth.top_n_levels == 0 {
            return Err(ConfigError("depth.top_n_levels must be positive".to_string()));
        }
        if self.depth.band_bps.iter().any(|band| *band == 0) {
            return Err(ConfigError("depth.band_bps values must be positive".to_string()));
        }
        if self.depth.stress_notional_usdt <= 0.0 {
            return Err(ConfigError(
                "depth.stress_notional_usdt must be positive".to_string(),
            ));
        }

        for key in self.pipeline.stage_timeouts_s.keys() {
            if !STAGE_TIMEOUT_KEYS.contains(&key.as_str()) {
                return Err(ConfigError(format!("Invalid stage timeout key: {key}")));
            }
        }
        let defaults = default_stage_timeouts(&self.sampling);
        for (stage, timeout_s) in defaults {
            self.pipeline
                .stage_timeouts_s
                .entry(stage.to_string())
                .or_insert(timeout_s);
        }

        self.validate_spread_timeout()
    }

    fn validate_spread_timeout(&self) -> Result<(), ConfigError> {
        let stage_timeout_s = self
            .pipeline
            .stage_timeouts_s
            .get("spread")
            .copied()
            .unwrap_or(0);
        if stage_timeout_s == 0 {
            return Ok(());
        }
        let threshold_s = stage_timeout_s.saturating_sub(self.pipeline.safety_margin_s);
        let spread_duration_s = self.sampling.spread.duration_s;
        if spread_duration_s >= threshold_s {
            let message = format!(
                "Spread sampling duration_s exceeds the allowed stage timeout buffer \
                 (duration_s={spread_duration_s}, stage_timeout_s={stage_timeout_s}, \
                 safety_margin_s={})",
                self.pipeline.safety_margin_s
            );
            if self.pipeline.spread_timeout_behavior == SpreadTimeoutBehavior::Error {
                return Err(ConfigError(message));
            }
            warn!("{message}");
        }
        Ok(())
    }

    /// SHA-256 over the JSON-serialized config with sorted keys and no
    /// whitespace; recorded in `run_meta.json` for reproducibility checks.
    pub fn config_hash(&self) -> String {
        // serde_json's Map is a BTreeMap, so keys come out sorted.
        let value = serde_json::to_value(self).expect("config is always serializable");
        let compact = serde_json::to_string(&value).expect("config is always serializable");
        let digest = Sha256::digest(compact.as_bytes());
        hex::encode(digest)
    }
}

fn default_stage_timeouts(sampling: &SamplingConfig) -> Vec<(&'static str, u64)> {
    vec![
        ("universe", 300),
        ("spread", sampling.spread.duration_s * 2 + 60),
        ("score", 300),
        ("depth", sampling.depth.duration_s * 2 + 60),
        ("report", 300),
    ]
}
