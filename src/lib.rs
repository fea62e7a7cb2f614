//! spreadscan - market-making feasibility scanner
//!
//! Batch research pipeline that walks the spot universe of an exchange,
//! samples live spreads and order-book depth under a shared rate limit,
//! scores every symbol against configurable feasibility thresholds, and
//! leaves a reproducible artifact directory behind for each run.
//!
//! Pipeline stages (fixed order): universe -> spread -> score -> depth -> report

pub mod analytics;
pub mod cleanup;
pub mod config;
pub mod io;
pub mod mexc;
pub mod models;
pub mod obs;
pub mod pipeline;
pub mod report;
pub mod validation;

/// Crate version recorded in run artifacts.
pub const SCANNER_VERSION: &str = env!("CARGO_PKG_VERSION");
