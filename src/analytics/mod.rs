//! Statistics, scoring and depth analytics.

pub mod depth_metrics;
pub mod scoring;
pub mod spread_stats;

pub use scoring::{collect_scoring_metrics, score_symbol, ScoreResult};
pub use spread_stats::{compute_spread_stats, percentile, SpreadStats, MIN_SAMPLE_COUNT};
