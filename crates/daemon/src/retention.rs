//! Age-based retention for raw and processed recordings.

use crate::layout::ChannelDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{error, info};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl PruneReport {
    pub fn merge(&mut self, other: PruneReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

/// Whole days between `modified` and `now`; files from the future are 0 days old.
pub fn file_age_days(modified: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(modified)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / SECS_PER_DAY
}

/// A file is pruned once it is strictly older than `max_age_days`.
pub fn should_prune(age_days: u64, max_age_days: u64) -> bool {
    age_days > max_age_days
}

/// Delete files directly inside `dir` older than `max_age_days`.
///
/// A failed deletion is logged and the sweep moves on to the next file.
pub fn prune_old_files(dir: &Path, max_age_days: u64, now: SystemTime) -> PruneReport {
    use walkdir::WalkDir;

    let mut report = PruneReport::default();
    if !dir.exists() {
        return report;
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };

        let age = file_age_days(modified, now);
        if !should_prune(age, max_age_days) {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), age_days = age, "Deleted old file");
                report.deleted.push(path.to_path_buf());
            }
            Err(e) => {
                error!(path = %path.display(), "Failed to delete old file: {}", e);
                report.failed.push(path.to_path_buf());
            }
        }
    }

    report
}

/// Sweep the raw and processed directories of every channel.
pub fn sweep(dirs: &[ChannelDirs], max_age_days: u64, now: SystemTime) -> PruneReport {
    let mut report = PruneReport::default();
    for d in dirs {
        report.merge(prune_old_files(&d.recorded, max_age_days, now));
        report.merge(prune_old_files(&d.processed, max_age_days, now));
    }
    report
}
