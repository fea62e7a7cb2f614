//! Age- and count-based eviction of run directories.
//!
//! The newest `keep_last` directories are always retained; anything older
//! than `keep_days` is removed. Eviction is the only mutation a finished
//! run directory ever sees.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

const SECONDS_IN_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct CleanupCandidate {
    path: PathBuf,
    modified_at: SystemTime,
}

#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

fn list_run_dirs(output_dir: &Path) -> std::io::Result<Vec<CleanupCandidate>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("run_") {
            continue;
        }
        let modified_at = entry.metadata()?.modified()?;
        candidates.push(CleanupCandidate { path, modified_at });
    }
    Ok(candidates)
}

fn select_removals(
    mut candidates: Vec<CleanupCandidate>,
    keep_days: u64,
    keep_last: usize,
    now: SystemTime,
) -> CleanupSummary {
    candidates.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

    let mut summary = CleanupSummary::default();
    let max_age = Duration::from_secs(keep_days.saturating_mul(SECONDS_IN_DAY));

    for (idx, candidate) in candidates.into_iter().enumerate() {
        if idx < keep_last {
            summary.kept.push(candidate.path);
            continue;
        }
        let age = now
            .duration_since(candidate.modified_at)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            summary.removed.push(candidate.path);
        } else {
            summary.skipped.push(candidate.path);
        }
    }
    summary
}

/// Returns a process exit code.
pub fn cleanup_output(
    output_dir: &Path,
    keep_days: u64,
    keep_last: usize,
    dry_run: bool,
    verbose: bool,
) -> i32 {
    if !output_dir.exists() {
        eprintln!("Output directory does not exist: {}", output_dir.display());
        return 1;
    }

    let candidates = match list_run_dirs(output_dir) {
        Ok(candidates) => candidates,
        Err(err) => {
            eprintln!("Failed to list {}: {err}", output_dir.display());
            return 1;
        }
    };
    if candidates.is_empty() {
        if verbose {
            println!("No run directories found in {}", output_dir.display());
        }
        return 0;
    }

    let summary = select_removals(candidates, keep_days, keep_last, SystemTime::now());

    for path in &summary.removed {
        if dry_run {
            println!("DRY-RUN remove {}", path.display());
            continue;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => {
                info!(path = %path.display(), "removed run directory");
                println!("Removed {}", path.display());
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove run directory");
                eprintln!("Failed to remove {}: {err}", path.display());
                return 1;
            }
        }
    }

    if verbose {
        for path in &summary.kept {
            println!("Kept (recent) {}", path.display());
        }
        for path in &summary.skipped {
            println!("Kept (within {keep_days} days) {}", path.display());
        }
    }

    println!(
        "Cleanup summary: removed={}, kept={}, skipped={}",
        summary.removed.len(),
        summary.kept.len(),
        summary.skipped.len()
    );
    0
}
