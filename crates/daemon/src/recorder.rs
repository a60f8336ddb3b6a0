//! Recording supervisor
//!
//! Owns one recording session from spawn to finalisation:
//! `Starting -> Running -> (NormalExit | Cancelled | Crashed) -> Finalized`.
//!
//! While running, the output file is polled on a fixed interval. Growth resets
//! the stall counter; a run of non-growing polls logs a stall warning but never
//! stops the recorder, which may resume writing after an upstream hiccup.
//! Cancellation sends a graceful terminate, then force-kills after a grace period.

use crate::config::Config;
use crate::metrics::{self, SharedMetrics};
use crate::state::SessionSlot;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between output size polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive non-growing polls before a stall is reported (~60s)
pub const STALL_POLLS: u32 = 12;

/// Time a recorder gets to exit after a terminate signal
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Maximum length of the file stem, in characters
pub const MAX_STEM_CHARS: usize = 200;

/// Extension of recorded files
pub const RECORDING_EXTENSION: &str = "mp4";

const STDERR_TAIL_LINES: usize = 20;

/// Error type for recording sessions
#[derive(Debug, Error)]
pub enum RecordError {
    /// Recorder binary could not be launched
    #[error("Failed to spawn recorder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or signalling the recorder failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle stage of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    NormalExit,
    Cancelled,
    Crashed,
    Finalized,
}

impl SessionState {
    /// Convert state to string for metrics
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::NormalExit => "normal_exit",
            SessionState::Cancelled => "cancelled",
            SessionState::Crashed => "crashed",
            SessionState::Finalized => "finalized",
        }
    }
}

/// How a session ended, judged by its output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// Recorder exited and left a non-empty file
    Completed { final_size: u64 },
    /// Recorder exited without producing data
    EmptyOrMissing,
    /// Session was stopped by shutdown; any non-empty file is kept as pending
    Cancelled { final_size: u64 },
}

impl RecordingOutcome {
    /// True when the session left a file for the processing pipeline
    pub fn has_pending_file(&self) -> bool {
        match self {
            RecordingOutcome::Completed { .. } => true,
            RecordingOutcome::Cancelled { final_size } => *final_size > 0,
            RecordingOutcome::EmptyOrMissing => false,
        }
    }
}

/// Settings shared by all sessions
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub streamlink_path: PathBuf,
    pub retry_open: u32,
    pub poll_interval: Duration,
    pub stall_polls: u32,
    pub terminate_grace: Duration,
}

impl RecorderSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            streamlink_path: cfg.recorder.streamlink_path.clone(),
            retry_open: cfg.recorder.retry_open,
            poll_interval: POLL_INTERVAL,
            stall_polls: STALL_POLLS,
            terminate_grace: TERMINATE_GRACE,
        }
    }
}

/// What to record and where
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub channel: String,
    pub quality: String,
    pub title: String,
    pub output_path: PathBuf,
}

/// Keep alphanumerics, spaces, hyphens and underscores; cap the length.
pub fn sanitize_file_stem(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .take(MAX_STEM_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// `<channel> - <YYYY-MM-DD HHhMMmSSs> - <title>.mp4`, sanitized.
///
/// Channel and timestamp come first so truncation only ever shortens the title.
pub fn build_output_filename(channel: &str, title: &str, started: DateTime<Local>) -> String {
    let stem = format!(
        "{} - {} - {}",
        channel,
        started.format("%Y-%m-%d %Hh%Mm%Ss"),
        title
    );
    format!("{}.{}", sanitize_file_stem(&stem), RECORDING_EXTENSION)
}

/// Build the recorder command line.
///
/// `streamlink --twitch-disable-ads --retry-open <n> twitch.tv/<channel> <quality> -o <path>`
pub fn build_streamlink_command(
    settings: &RecorderSettings,
    request: &RecordingRequest,
) -> Command {
    let mut cmd = Command::new(&settings.streamlink_path);

    cmd.arg("--twitch-disable-ads");
    cmd.arg("--retry-open").arg(settings.retry_open.to_string());
    cmd.arg(format!("twitch.tv/{}", request.channel));
    cmd.arg(&request.quality);
    cmd.arg("-o").arg(&request.output_path);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd
}

/// Observation produced by [`GrowthTracker::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthEvent {
    Growing,
    /// No growth, stall threshold not reached yet
    Idle { polls: u32 },
    /// Threshold reached on this poll
    Stalled { polls: u32 },
    /// Growth after a reported stall
    Resumed,
}

/// Tracks output growth across polls
#[derive(Debug, Clone)]
pub struct GrowthTracker {
    last_size: u64,
    stalled_polls: u32,
    threshold: u32,
}

impl GrowthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            last_size: 0,
            stalled_polls: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_polls >= self.threshold
    }

    pub fn observe(&mut self, size: u64) -> GrowthEvent {
        if size > self.last_size {
            let was_stalled = self.is_stalled();
            self.last_size = size;
            self.stalled_polls = 0;
            if was_stalled {
                GrowthEvent::Resumed
            } else {
                GrowthEvent::Growing
            }
        } else {
            self.stalled_polls = self.stalled_polls.saturating_add(1);
            if self.stalled_polls == self.threshold {
                GrowthEvent::Stalled {
                    polls: self.stalled_polls,
                }
            } else {
                GrowthEvent::Idle {
                    polls: self.stalled_polls,
                }
            }
        }
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

fn forward_stderr(channel: String, stderr: ChildStderr) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(channel = %channel, "recorder: {}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    })
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, "Failed to send SIGTERM: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop recorder: {}", e);
    }
}

/// Graceful terminate, then force-kill once `grace` has passed.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?child.id(), "Recorder ignored terminate, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

enum Stop {
    Exited(ExitStatus),
    Cancelled,
}

/// Run one recording session to completion.
///
/// Takes ownership of the slot so it is released when this returns, whatever
/// the outcome.
pub async fn record(
    slot: SessionSlot,
    request: &RecordingRequest,
    settings: &RecorderSettings,
    metrics: &SharedMetrics,
) -> Result<RecordingOutcome, RecordError> {
    let channel = request.channel.as_str();
    let session_id = slot.session_id();
    metrics::start_recording(metrics, session_id, request).await;

    let result = supervise(&slot, request, settings, metrics).await;

    metrics::finish_recording(metrics, session_id, result.as_ref().ok()).await;
    match &result {
        Ok(outcome) => info!(
            channel,
            ?outcome,
            state = SessionState::Finalized.as_str(),
            "Recording session finalized"
        ),
        Err(e) => error!(channel, "Recording session failed: {}", e),
    }
    drop(slot);
    result
}

async fn supervise(
    slot: &SessionSlot,
    request: &RecordingRequest,
    settings: &RecorderSettings,
    metrics: &SharedMetrics,
) -> Result<RecordingOutcome, RecordError> {
    let channel = request.channel.as_str();
    let path = request.output_path.as_path();

    debug!(
        channel,
        state = SessionState::Starting.as_str(),
        path = %path.display(),
        "Spawning recorder"
    );
    let mut child = build_streamlink_command(settings, request)
        .spawn()
        .map_err(|source| RecordError::Spawn {
            program: settings.streamlink_path.display().to_string(),
            source,
        })?;
    slot.set_pid(child.id());

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| forward_stderr(channel.to_string(), stderr));

    info!(
        channel,
        pid = ?child.id(),
        state = SessionState::Running.as_str(),
        path = %path.display(),
        "Recording started"
    );

    let cancel = slot.cancellation().clone();
    let mut tracker = GrowthTracker::new(settings.stall_polls);
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let stop = loop {
        tokio::select! {
            status = child.wait() => break Stop::Exited(status?),
            _ = cancel.cancelled() => break Stop::Cancelled,
            _ = ticker.tick() => {
                let size = file_size(path).await;
                match tracker.observe(size) {
                    GrowthEvent::Stalled { polls } => warn!(
                        channel,
                        bytes = size,
                        stalled_secs = polls as u64 * settings.poll_interval.as_secs(),
                        "Recording output stopped growing"
                    ),
                    GrowthEvent::Resumed => {
                        info!(channel, bytes = size, "Recording output growing again")
                    }
                    _ => {}
                }
                metrics::update_recording(metrics, slot.session_id(), size, tracker.is_stalled())
                    .await;
            }
        }
    };

    let state = match &stop {
        Stop::Cancelled => {
            info!(channel, "Stopping recorder for shutdown");
            let status = terminate(&mut child, settings.terminate_grace).await?;
            debug!(channel, %status, "Recorder stopped");
            SessionState::Cancelled
        }
        Stop::Exited(status) if status.success() => SessionState::NormalExit,
        Stop::Exited(_) => SessionState::Crashed,
    };

    let stderr_tail = match stderr_task {
        Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default(),
        None => Vec::new(),
    };

    if let (SessionState::Crashed, Stop::Exited(status)) = (state, &stop) {
        warn!(
            channel,
            %status,
            stderr = %stderr_tail.join("\n"),
            "Recorder exited with failure"
        );
    }

    let final_size = file_size(path).await;
    let outcome = match state {
        SessionState::Cancelled => RecordingOutcome::Cancelled { final_size },
        _ if final_size > 0 => RecordingOutcome::Completed { final_size },
        _ => RecordingOutcome::EmptyOrMissing,
    };

    debug!(channel, state = state.as_str(), ?outcome, "Recorder exited");
    Ok(outcome)
}
