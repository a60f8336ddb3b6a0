//! Admission control for new recordings.
//!
//! Gates are checked cheapest first and short-circuit on the first failure:
//! 1. active recordings < cap (no system calls)
//! 2. CPU usage <= threshold
//! 3. memory usage <= threshold
//! 4. free space on the recording volume >= minimum
//!
//! Resource numbers are instantaneous samples. A denial is a deferral, not an
//! error: the channel is simply probed again next cycle.

use crate::config::LimitsConfig;
use crate::state::{RecorderState, ReserveError, SessionSlot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, System};
use tracing::debug;

/// Instantaneous host resource readings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// None when the volume could not be matched to a mounted disk
    pub disk_free_bytes: Option<u64>,
}

/// Why a recording was not admitted
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    AtCapacity { active: usize, max: usize },
    CpuBusy { percent: f32, threshold: f32 },
    MemoryBusy { percent: f32, threshold: f32 },
    LowDisk { free_bytes: u64, required_bytes: u64 },
    AlreadyRecording,
    ShuttingDown,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::AtCapacity { active, max } => {
                write!(f, "{} of {} recordings already running", active, max)
            }
            DenyReason::CpuBusy { percent, threshold } => {
                write!(f, "CPU at {:.1}% (limit {:.1}%)", percent, threshold)
            }
            DenyReason::MemoryBusy { percent, threshold } => {
                write!(f, "memory at {:.1}% (limit {:.1}%)", percent, threshold)
            }
            DenyReason::LowDisk {
                free_bytes,
                required_bytes,
            } => write!(
                f,
                "{} bytes free on recording volume (need {})",
                free_bytes, required_bytes
            ),
            DenyReason::AlreadyRecording => write!(f, "channel is already being recorded"),
            DenyReason::ShuttingDown => write!(f, "shutdown in progress"),
        }
    }
}

impl From<ReserveError> for DenyReason {
    fn from(e: ReserveError) -> Self {
        match e {
            ReserveError::AtCapacity { active, max } => DenyReason::AtCapacity { active, max },
            ReserveError::AlreadyRecording => DenyReason::AlreadyRecording,
            ReserveError::ShuttingDown => DenyReason::ShuttingDown,
        }
    }
}

/// Result of an admission attempt
#[derive(Debug)]
pub enum AdmissionDecision {
    /// Slot reserved; dropping it releases the slot
    Admit(SessionSlot),
    Deny(DenyReason),
}

/// Host resource readings used by admission and probe throttling
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Current global CPU usage in percent
    async fn cpu_percent(&self) -> f32;

    /// CPU, memory and free disk space for the volume holding `volume`
    async fn sample(&self, volume: &Path) -> ResourceSample;
}

/// [`ResourceSampler`] backed by sysinfo
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut system)
    }

    fn memory_percent(&self) -> f32 {
        self.with_system(|sys| {
            sys.refresh_memory();
            let total = sys.total_memory();
            if total > 0 {
                (sys.used_memory() as f64 / total as f64 * 100.0) as f32
            } else {
                0.0
            }
        })
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn cpu_percent(&self) -> f32 {
        // CPU usage is a delta between two refreshes
        self.with_system(|sys| sys.refresh_cpu_usage());
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.with_system(|sys| {
            sys.refresh_cpu_usage();
            sys.global_cpu_usage()
        })
    }

    async fn sample(&self, volume: &Path) -> ResourceSample {
        let cpu_percent = self.cpu_percent().await;
        let memory_percent = self.memory_percent();
        let volume = volume.to_path_buf();
        let disk_free_bytes = tokio::task::spawn_blocking(move || free_space_for(&volume))
            .await
            .ok()
            .flatten();

        ResourceSample {
            cpu_percent,
            memory_percent,
            disk_free_bytes,
        }
    }
}

/// Free bytes on the disk whose mount point is the longest prefix of `path`
pub fn free_space_for(path: &Path) -> Option<u64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Apply gates 2-4 to a sample, in order.
pub fn check_resources(sample: &ResourceSample, limits: &LimitsConfig) -> Option<DenyReason> {
    if sample.cpu_percent > limits.cpu_threshold_percent {
        return Some(DenyReason::CpuBusy {
            percent: sample.cpu_percent,
            threshold: limits.cpu_threshold_percent,
        });
    }

    if sample.memory_percent > limits.memory_threshold_percent {
        return Some(DenyReason::MemoryBusy {
            percent: sample.memory_percent,
            threshold: limits.memory_threshold_percent,
        });
    }

    if let Some(free_bytes) = sample.disk_free_bytes {
        if free_bytes < limits.min_free_disk_bytes {
            return Some(DenyReason::LowDisk {
                free_bytes,
                required_bytes: limits.min_free_disk_bytes,
            });
        }
    }

    None
}

/// Decides whether a new recording may start
pub struct AdmissionController {
    limits: LimitsConfig,
    sampler: Arc<dyn ResourceSampler>,
    recording_volume: PathBuf,
}

impl AdmissionController {
    pub fn new(
        limits: LimitsConfig,
        sampler: Arc<dyn ResourceSampler>,
        recording_volume: PathBuf,
    ) -> Self {
        Self {
            limits,
            sampler,
            recording_volume,
        }
    }

    /// Run every gate without reserving anything.
    pub async fn can_admit(&self, state: &RecorderState) -> bool {
        self.evaluate(state).await.is_none()
    }

    /// Run every gate and, if all pass, reserve a slot for `channel`.
    ///
    /// The final capacity check and the increment happen under the state lock,
    /// so two channels that both passed the pre-check cannot both be admitted
    /// into the last slot.
    pub async fn try_admit(&self, state: &Arc<RecorderState>, channel: &str) -> AdmissionDecision {
        if let Some(reason) = self.evaluate(state).await {
            debug!(channel, %reason, "Admission denied");
            return AdmissionDecision::Deny(reason);
        }

        match state.try_reserve(channel) {
            Ok(slot) => AdmissionDecision::Admit(slot),
            Err(e) => AdmissionDecision::Deny(e.into()),
        }
    }

    async fn evaluate(&self, state: &RecorderState) -> Option<DenyReason> {
        if !state.has_room() {
            return Some(DenyReason::AtCapacity {
                active: state.active_count(),
                max: state.max_concurrent(),
            });
        }

        let sample = self.sampler.sample(&self.recording_volume).await;
        check_resources(&sample, &self.limits)
    }
}
