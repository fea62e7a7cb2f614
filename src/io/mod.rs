//! Run-directory layout and artifact writers.

pub mod depth_export;
pub mod export_universe;
pub mod layout;
pub mod raw_writer;
pub mod summary_export;
