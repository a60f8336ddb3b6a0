//! Daemon startup and orchestrator loop
//!
//! Each cycle samples host CPU, probes every configured channel on a bounded
//! worker pool, starts recordings for channels that came online, and hands one
//! pending file to the processing pipeline when no recording is active.

use crate::admission::{
    AdmissionController, AdmissionDecision, DenyReason, ResourceSampler, SysinfoSampler,
};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{ChannelConfig, Config, ConfigError};
use crate::layout::ChannelDirs;
use crate::metrics::{new_shared_metrics, now_unix_ms, SharedMetrics, SystemMonitor};
use crate::pipeline::{PipelineOutcome, PipelineSettings, ProcessingPipeline};
use crate::probe::{probe_channel, HelixProbe, LivenessResult, StatusProbe};
use crate::recorder::{
    build_output_filename, record, RecorderSettings, RecordingOutcome, RecordingRequest,
};
use crate::retention;
use crate::startup::{prepare_directories, run_startup_checks, StartupError};
use crate::state::RecorderState;
use crate::status_server::{run_status_server, ServerError};
use crate::token::{HelixTokenFetcher, TokenError, TokenManager};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const HTTP_USER_AGENT: &str = concat!("stream-recorder/", env!("CARGO_PKG_VERSION"));
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time on top of the terminate grace before shutdown stops waiting
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Initial access token could not be obtained
    #[error("Failed to obtain access token: {0}")]
    Token(#[from] TokenError),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),

    /// A blocking startup task panicked or was cancelled
    #[error("Startup task failed: {0}")]
    StartupTask(#[from] tokio::task::JoinError),

    /// Server error
    #[error("Status server error: {0}")]
    Server(#[from] ServerError),
}

/// External collaborators of the orchestrator
pub struct DaemonDeps {
    pub tokens: Arc<TokenManager>,
    pub prober: Arc<dyn StatusProbe>,
    pub sampler: Arc<dyn ResourceSampler>,
}

/// Timing and tool settings, derived from configuration
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub recorder: RecorderSettings,
    pub pipeline: PipelineSettings,
    pub refresh_interval: Duration,
    /// Bound on waiting for one cycle's probes
    pub cycle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl DaemonOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let refresh_interval = Duration::from_secs(cfg.recorder.refresh_interval_secs);
        Self {
            recorder: RecorderSettings::from_config(cfg),
            pipeline: PipelineSettings::from_config(cfg),
            refresh_interval,
            cycle_timeout: refresh_interval,
            sweep_interval: Duration::from_secs(cfg.retention.sweep_interval_secs),
        }
    }
}

/// What happened to one channel in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    Offline,
    NotFound,
    /// Probe failed; retried next cycle
    ProbeFailed(String),
    /// Session already running, not probed
    AlreadyRecording,
    Denied(DenyReason),
    Started { output_path: PathBuf },
}

/// Summary of one scheduling cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Probing was skipped because the host was busy
    pub skipped: bool,
    pub cpu_percent: f32,
    pub outcomes: Vec<(String, ChannelOutcome)>,
    /// Channels whose probe did not finish before the cycle timeout
    pub timed_out: Vec<String>,
}

impl CycleReport {
    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, outcome)| outcome)
    }

    pub fn started(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ChannelOutcome::Started { .. }))
            .count()
    }
}

/// State shared with probe and session tasks
struct Shared {
    tokens: Arc<TokenManager>,
    prober: Arc<dyn StatusProbe>,
    admission: AdmissionController,
    state: Arc<RecorderState>,
    recorder: RecorderSettings,
    metrics: SharedMetrics,
    sessions: TaskTracker,
}

/// The recording orchestrator
pub struct Daemon {
    /// Validated configuration
    pub config: Config,
    /// Derived concurrency plan
    pub plan: ConcurrencyPlan,
    options: DaemonOptions,
    dirs: Vec<ChannelDirs>,
    sampler: Arc<dyn ResourceSampler>,
    pipeline: Arc<ProcessingPipeline>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Full startup sequence:
    /// 1. Startup checks (directories, root writability, recorder, ffmpeg)
    /// 2. HTTP client and Helix collaborators
    /// 3. Initial token fetch, fatal on failure
    pub async fn new(config: Config, shutdown: CancellationToken) -> Result<Self, DaemonError> {
        let check_cfg = config.clone();
        let dirs = tokio::task::spawn_blocking(move || run_startup_checks(&check_cfg)).await??;
        Self::connect(config, dirs, shutdown).await
    }

    /// Like [`Daemon::new`] but only creates the directory layout.
    ///
    /// Useful when the external tools are not installed on this host.
    pub async fn new_without_checks(
        config: Config,
        shutdown: CancellationToken,
    ) -> Result<Self, DaemonError> {
        let dirs = prepare_directories(&config)?;
        Self::connect(config, dirs, shutdown).await
    }

    async fn connect(
        config: Config,
        dirs: Vec<ChannelDirs>,
        shutdown: CancellationToken,
    ) -> Result<Self, DaemonError> {
        let client = reqwest::Client::builder()
            .user_agent(HTTP_USER_AGENT)
            .build()
            .map_err(|e| DaemonError::Client(e.to_string()))?;

        let fetcher = HelixTokenFetcher::new(
            client.clone(),
            config.twitch.token_url.clone(),
            config.twitch.client_id.clone(),
            config.twitch.client_secret.clone(),
        );
        let tokens = Arc::new(TokenManager::new(Arc::new(fetcher)));
        tokens.ensure_valid_token().await?;
        info!("Access token acquired");

        let prober = HelixProbe::new(
            client,
            config.twitch.streams_url.clone(),
            config.twitch.client_id.clone(),
        );
        let deps = DaemonDeps {
            tokens,
            prober: Arc::new(prober),
            sampler: Arc::new(SysinfoSampler::new()),
        };
        let options = DaemonOptions::from_config(&config);
        Ok(Self::with_deps(config, dirs, deps, options, shutdown))
    }

    /// Assemble a daemon from already-built collaborators.
    pub fn with_deps(
        config: Config,
        dirs: Vec<ChannelDirs>,
        deps: DaemonDeps,
        options: DaemonOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let plan = derive_plan(&config);
        let state = RecorderState::new(plan.max_concurrent_recordings, shutdown.clone());
        let metrics = new_shared_metrics();

        let admission = AdmissionController::new(
            config.limits.clone(),
            Arc::clone(&deps.sampler),
            config.recorder.root_path.clone(),
        );
        let pipeline = Arc::new(ProcessingPipeline::new(
            options.pipeline.clone(),
            dirs.clone(),
            Arc::clone(&state),
            metrics.clone(),
        ));
        let shared = Arc::new(Shared {
            tokens: deps.tokens,
            prober: deps.prober,
            admission,
            state,
            recorder: options.recorder.clone(),
            metrics,
            sessions: TaskTracker::new(),
        });

        Self {
            config,
            plan,
            options,
            dirs,
            sampler: deps.sampler,
            pipeline,
            shared,
            shutdown,
        }
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.shared.metrics.clone()
    }

    pub fn state(&self) -> &Arc<RecorderState> {
        &self.shared.state
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run one processing step in the foreground.
    pub async fn process_pending(&self) -> PipelineOutcome {
        self.pipeline.process_one_if_idle().await
    }

    /// One scheduling cycle: CPU gate, then probes on the bounded pool.
    pub async fn run_cycle(&self) -> CycleReport {
        let cpu_percent = self.sampler.cpu_percent().await;
        let threshold = self.config.limits.probe_cpu_threshold_percent;
        if cpu_percent > threshold {
            info!(cpu_percent, threshold, "Host busy, skipping probe cycle");
            self.shared.metrics.write().await.skipped_cycles += 1;
            return CycleReport {
                skipped: true,
                cpu_percent,
                ..CycleReport::default()
            };
        }

        let pool = Arc::new(Semaphore::new(self.plan.probe_workers));
        let mut tasks = JoinSet::new();
        let mut outstanding = BTreeSet::new();
        let mut outcomes = Vec::with_capacity(self.config.channels.len());

        for (channel, dirs) in self.config.channels.iter().zip(&self.dirs) {
            if self.shared.state.is_registered(&channel.name) {
                debug!(channel = %channel.name, "Already recording, not probing");
                outcomes.push((channel.name.clone(), ChannelOutcome::AlreadyRecording));
                continue;
            }

            outstanding.insert(channel.name.clone());
            let shared = Arc::clone(&self.shared);
            let pool = Arc::clone(&pool);
            let job = ChannelJob {
                channel: channel.clone(),
                quality: self.config.quality_for(channel).to_string(),
                dirs: dirs.clone(),
            };
            tasks.spawn(async move {
                let name = job.channel.name.clone();
                let outcome = match pool.acquire_owned().await {
                    Ok(_permit) => probe_and_maybe_record(&shared, job).await,
                    Err(_) => ChannelOutcome::ProbeFailed("probe pool closed".to_string()),
                };
                (name, outcome)
            });
        }

        let deadline = tokio::time::Instant::now() + self.options.cycle_timeout;
        loop {
            tokio::select! {
                joined = tokio::time::timeout_at(deadline, tasks.join_next()) => match joined {
                    Ok(Some(Ok((name, outcome)))) => {
                        outstanding.remove(&name);
                        outcomes.push((name, outcome));
                    }
                    Ok(Some(Err(e))) => error!("Probe task failed: {}", e),
                    Ok(None) => break,
                    Err(_) => {
                        warn!(channels = ?outstanding, "Probe cycle timed out");
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
        tasks.abort_all();

        self.shared.metrics.write().await.cycles += 1;
        CycleReport {
            skipped: false,
            cpu_percent,
            outcomes,
            timed_out: outstanding.into_iter().collect(),
        }
    }

    /// Run the orchestrator until the shutdown token is cancelled, then stop
    /// every recording session.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            channels = self.config.channels.len(),
            probe_workers = self.plan.probe_workers,
            max_recordings = self.plan.max_concurrent_recordings,
            "Recorder started"
        );

        let mut pipeline_task: Option<JoinHandle<PipelineOutcome>> = None;
        let mut last_sweep: Option<Instant> = None;

        while !self.shutdown.is_cancelled() {
            let report = self.run_cycle().await;
            debug!(?report, "Cycle finished");

            self.poll_pipeline(&mut pipeline_task).await;

            if last_sweep.map_or(true, |t| t.elapsed() >= self.options.sweep_interval) {
                self.sweep_retention().await;
                last_sweep = Some(Instant::now());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.refresh_interval) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        info!("Shutdown requested");
        let stopped = self.shutdown_sessions().await;
        if let Some(task) = pipeline_task {
            if let Ok(Ok(outcome)) = tokio::time::timeout(SHUTDOWN_SLACK, task).await {
                debug!(?outcome, "Processing stopped");
            }
        }
        info!(sessions = stopped, "Recorder stopped");
        Ok(())
    }

    /// Reap a finished pipeline run and start a new one if the host is idle.
    async fn poll_pipeline(&self, task: &mut Option<JoinHandle<PipelineOutcome>>) {
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        if let Some(handle) = task.take() {
            match handle.await {
                Ok(outcome) => debug!(?outcome, "Processing step finished"),
                Err(e) => error!("Processing task failed: {}", e),
            }
        }

        if self.shared.state.is_idle() {
            let pipeline = Arc::clone(&self.pipeline);
            *task = Some(tokio::spawn(async move { pipeline.process_one_if_idle().await }));
        }
    }

    /// Delete aged files from every channel's directories.
    pub async fn sweep_retention(&self) -> retention::PruneReport {
        let dirs = self.dirs.clone();
        let days = self.config.retention.prune_after_days;
        let report =
            tokio::task::spawn_blocking(move || retention::sweep(&dirs, days, SystemTime::now()))
                .await
                .unwrap_or_else(|e| {
                    error!("Retention sweep failed: {}", e);
                    retention::PruneReport::default()
                });

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Retention sweep finished"
            );
        }
        self.shared.metrics.write().await.pruned_files += report.deleted.len() as u64;
        report
    }

    /// Cancel every session, then wait for them to finish.
    ///
    /// Recorders get the terminate grace period before being killed; this waits
    /// a little longer than that. Returns the number of sessions signalled.
    pub async fn shutdown_sessions(&self) -> usize {
        self.shutdown.cancel();
        let signalled = self.shared.state.terminate_all();
        if signalled > 0 {
            info!(sessions = signalled, "Stopping recording sessions");
        }

        self.shared.sessions.close();
        let limit = self.options.recorder.terminate_grace + SHUTDOWN_SLACK;
        if tokio::time::timeout(limit, self.shared.sessions.wait()).await.is_err() {
            warn!(
                remaining = ?self.shared.state.registered_channels(),
                "Recording sessions did not stop in time"
            );
        }
        signalled
    }

    /// Periodically refresh the system and summary fields of the snapshot.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let metrics = self.shared.metrics.clone();
        let state = Arc::clone(&self.shared.state);
        let shutdown = self.shutdown.clone();
        let channels: Vec<String> = self.config.channels.iter().map(|c| c.name.clone()).collect();

        let monitor = Arc::new(std::sync::Mutex::new(SystemMonitor::new()));

        tokio::spawn(async move {
            loop {
                let sampler = Arc::clone(&monitor);
                let system = tokio::task::spawn_blocking(move || {
                    sampler
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .collect()
                })
                .await
                .unwrap_or_default();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system;
                    snapshot.timestamp_unix_ms = now_unix_ms();
                    snapshot.channels = channels.clone();
                    snapshot.active_recordings = state.active_count();
                    snapshot.max_concurrent_recordings = state.max_concurrent();
                }
                tokio::select! {
                    _ = tokio::time::sleep(STATUS_REFRESH_INTERVAL) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Start the status HTTP server if enabled
    pub fn start_status_server(&self) -> Option<JoinHandle<()>> {
        if !self.config.status.enabled {
            return None;
        }
        let listen = self.config.status.listen.clone();
        let metrics = self.shared.metrics.clone();
        let shutdown = self.shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(&listen, metrics, shutdown).await {
                error!("Status server error: {}", e);
            }
        }))
    }

    /// Run the daemon with the status server and metrics updater.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let server = self.start_status_server();
        let updater = self.start_metrics_updater();

        let result = self.run().await;

        updater.abort();
        if let Some(server) = server {
            let _ = tokio::time::timeout(SHUTDOWN_SLACK, server).await;
        }
        result
    }
}

struct ChannelJob {
    channel: ChannelConfig,
    quality: String,
    dirs: ChannelDirs,
}

/// Probe one channel and start a session if it is online and admitted.
async fn probe_and_maybe_record(shared: &Arc<Shared>, job: ChannelJob) -> ChannelOutcome {
    let name = job.channel.name.as_str();

    let title = match probe_channel(shared.prober.as_ref(), &shared.tokens, name).await {
        LivenessResult::Online { title } => title,
        LivenessResult::Offline => {
            info!(channel = name, "Channel offline");
            return ChannelOutcome::Offline;
        }
        LivenessResult::NotFound => {
            error!(channel = name, "Channel not found, check the configured name");
            return ChannelOutcome::NotFound;
        }
        LivenessResult::Unauthorized => {
            warn!(channel = name, "Liveness query unauthorized");
            return ChannelOutcome::ProbeFailed("unauthorized".to_string());
        }
        LivenessResult::TransientError(reason) => {
            warn!(channel = name, %reason, "Liveness query failed, retrying next cycle");
            return ChannelOutcome::ProbeFailed(reason);
        }
    };

    let slot = match shared.admission.try_admit(&shared.state, name).await {
        AdmissionDecision::Admit(slot) => slot,
        AdmissionDecision::Deny(reason) => {
            info!(channel = name, %reason, "Channel online, recording deferred");
            return ChannelOutcome::Denied(reason);
        }
    };

    let file_name = build_output_filename(name, &title, chrono::Local::now());
    let output_path = job.dirs.recorded.join(file_name);
    info!(
        channel = name,
        title = %title,
        path = %output_path.display(),
        "Channel online, recording"
    );

    let request = RecordingRequest {
        channel: name.to_string(),
        quality: job.quality,
        title,
        output_path: output_path.clone(),
    };
    let session_shared = Arc::clone(shared);
    shared.sessions.spawn(async move {
        let result = record(
            slot,
            &request,
            &session_shared.recorder,
            &session_shared.metrics,
        )
        .await;
        match result {
            Ok(outcome) if outcome.has_pending_file() => {
                info!(
                    channel = %request.channel,
                    path = %request.output_path.display(),
                    "Recording pending processing"
                );
            }
            Ok(RecordingOutcome::EmptyOrMissing) => {
                warn!(channel = %request.channel, "Recording produced no data");
            }
            // Failures are logged by the session itself
            Ok(_) | Err(_) => {}
        }
    });

    ChannelOutcome::Started { output_path }
}
