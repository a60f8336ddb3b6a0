//! Retry bookkeeping for pending files that failed processing.
//!
//! A failed file stays in `recorded/` and becomes eligible again after a
//! backoff that doubles with every failure. Among eligible files the one with
//! the fewest failures goes first, so a file that never processes cannot hold
//! back the rest of the queue.

use crate::scan::PendingFile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Delay after the first failure
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Upper bound on the delay between attempts
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before a file that failed `attempts` times may be retried.
///
/// `base`, `2 * base`, `4 * base`, ... capped at [`MAX_RETRY_BACKOFF`].
pub fn retry_delay(base: Duration, attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_RETRY_BACKOFF)
        .min(MAX_RETRY_BACKOFF)
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    attempts: u32,
    last_failure: Instant,
}

/// Failed attempts per pending file
#[derive(Debug)]
pub struct FailureLedger {
    base: Duration,
    entries: Mutex<HashMap<PathBuf, FailureRecord>>,
}

impl FailureLedger {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, FailureRecord>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count a failure; returns the number of failures so far.
    pub fn record_failure(&self, path: &Path, now: Instant) -> u32 {
        let mut entries = self.lock();
        let record = entries.entry(path.to_path_buf()).or_insert(FailureRecord {
            attempts: 0,
            last_failure: now,
        });
        record.attempts = record.attempts.saturating_add(1);
        record.last_failure = now;
        record.attempts
    }

    pub fn clear(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn attempts(&self, path: &Path) -> u32 {
        self.lock().get(path).map_or(0, |r| r.attempts)
    }

    /// When `path` may be retried, if it is currently backing off.
    pub fn retry_at(&self, path: &Path) -> Option<Instant> {
        self.lock()
            .get(path)
            .map(|r| r.last_failure + retry_delay(self.base, r.attempts))
    }

    /// Pick the next file to process from `pending` (in scan order).
    ///
    /// Files still backing off are skipped; the rest are ordered by failure
    /// count, then scan order. Entries for files no longer pending are dropped.
    pub fn select(&self, pending: Vec<PendingFile>, now: Instant) -> Option<PendingFile> {
        let mut entries = self.lock();
        entries.retain(|path, _| pending.iter().any(|p| &p.path == path));

        pending
            .into_iter()
            .filter_map(|file| match entries.get(&file.path) {
                None => Some((0, file)),
                Some(r) if now >= r.last_failure + retry_delay(self.base, r.attempts) => {
                    Some((r.attempts, file))
                }
                Some(_) => None,
            })
            .min_by_key(|(attempts, _)| *attempts)
            .map(|(_, file)| file)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
