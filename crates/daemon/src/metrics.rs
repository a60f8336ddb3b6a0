//! Status metrics for the recorder
//!
//! Provides the recording, system and aggregate counters served by the
//! status endpoint, with JSON serialization support.

use crate::recorder::{RecordingOutcome, RecordingRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-session progress of a running recording
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingMetrics {
    pub session_id: String,
    pub channel: String,
    pub title: String,
    pub output_path: String,
    pub started_unix_ms: i64,
    pub bytes_written: u64,
    pub stalled: bool,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot: running recordings, host load and counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub channels: Vec<String>,
    pub recordings: Vec<RecordingMetrics>,
    pub system: SystemMetrics,
    pub active_recordings: usize,
    pub max_concurrent_recordings: usize,
    pub completed_recordings: u64,
    pub interrupted_recordings: u64,
    pub empty_recordings: u64,
    pub failed_recordings: u64,
    pub processed_files: u64,
    pub failed_transcodes: u64,
    pub mirror_failures: u64,
    pub pruned_files: u64,
    pub cycles: u64,
    pub skipped_cycles: u64,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn start_recording(
    metrics: &SharedMetrics,
    session_id: Uuid,
    request: &RecordingRequest,
) {
    let mut snapshot = metrics.write().await;
    snapshot.recordings.push(RecordingMetrics {
        session_id: session_id.to_string(),
        channel: request.channel.clone(),
        title: request.title.clone(),
        output_path: request.output_path.display().to_string(),
        started_unix_ms: now_unix_ms(),
        bytes_written: 0,
        stalled: false,
    });
}

pub async fn update_recording(
    metrics: &SharedMetrics,
    session_id: Uuid,
    bytes: u64,
    stalled: bool,
) {
    let id = session_id.to_string();
    let mut snapshot = metrics.write().await;
    if let Some(rec) = snapshot.recordings.iter_mut().find(|r| r.session_id == id) {
        rec.bytes_written = bytes;
        rec.stalled = stalled;
    }
}

/// Remove the session entry and count its outcome. `None` means the session failed.
pub async fn finish_recording(
    metrics: &SharedMetrics,
    session_id: Uuid,
    outcome: Option<&RecordingOutcome>,
) {
    let id = session_id.to_string();
    let mut snapshot = metrics.write().await;
    snapshot.recordings.retain(|r| r.session_id != id);
    match outcome {
        Some(RecordingOutcome::Completed { .. }) => snapshot.completed_recordings += 1,
        Some(RecordingOutcome::Cancelled { .. }) => snapshot.interrupted_recordings += 1,
        Some(RecordingOutcome::EmptyOrMissing) => snapshot.empty_recordings += 1,
        None => snapshot.failed_recordings += 1,
    }
}

/// System metrics sampler.
///
/// CPU usage is the delta between two refreshes, so one `System` is kept
/// across calls; the first reading after [`SystemMonitor::new`] covers the time
/// since construction.
pub struct SystemMonitor {
    system: System,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    /// Collects current system metrics using sysinfo
    pub fn collect(&mut self) -> SystemMetrics {
        let sys = &mut self.system;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_usage = sys.global_cpu_usage();
        let total_memory = sys.total_memory();
        let used_memory = sys.used_memory();
        let mem_usage = if total_memory > 0 {
            (used_memory as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };

        let load_avg = System::load_average();

        SystemMetrics {
            cpu_usage_percent: cpu_usage,
            mem_usage_percent: mem_usage,
            load_avg_1: load_avg.one as f32,
            load_avg_5: load_avg.five as f32,
            load_avg_15: load_avg.fifteen as f32,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}
