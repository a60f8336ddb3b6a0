//! Idle-time processing of pending files.
//!
//! Each invocation handles at most one file:
//! settle check, re-idle check, move or transcode, then an optional mirror copy.
//! Every step can fail on its own; failures are logged and the raw file stays
//! in `recorded/` for a later idle window, behind a per-file backoff.

use crate::config::Config;
use crate::encode::{run_transcode, transcode_timeout, TranscodeError, TranscodeParams};
use crate::failures::{FailureLedger, DEFAULT_RETRY_BACKOFF};
use crate::layout::ChannelDirs;
use crate::metrics::SharedMetrics;
use crate::scan::{scan_pending, PendingFile};
use crate::stability::{check_settled, SettleResult, DEFAULT_SETTLE_WINDOW};
use crate::state::RecorderState;
use crate::transfer::{mirror_file, move_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings for the processing pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ffmpeg_path: PathBuf,
    pub disable_transcode: bool,
    pub settle_window: Duration,
    /// Root of the mirror copy, when mirroring is enabled
    pub mirror_root: Option<PathBuf>,
    /// Wait after a file's first failed attempt; doubles per failure
    pub retry_backoff: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.recorder.ffmpeg_path.clone(),
            disable_transcode: cfg.recorder.disable_transcode,
            settle_window: DEFAULT_SETTLE_WINDOW,
            mirror_root: if cfg.mirror.enabled {
                cfg.mirror.path.clone()
            } else {
                None
            },
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// What one invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A recording was active, nothing was touched
    NotIdle,
    ShuttingDown,
    NothingPending,
    /// The file is still being written
    StillWriting(PathBuf),
    /// A recording started while the file was being checked or transcoded
    Aborted(PathBuf),
    Processed {
        source: PathBuf,
        output: PathBuf,
        mirrored: Option<PathBuf>,
    },
    /// Move or transcode failed; the raw file is kept for a retry
    Failed { source: PathBuf, reason: String },
}

/// Processes pending files during idle windows
pub struct ProcessingPipeline {
    settings: PipelineSettings,
    dirs: Vec<ChannelDirs>,
    state: Arc<RecorderState>,
    metrics: SharedMetrics,
    failures: FailureLedger,
}

impl ProcessingPipeline {
    pub fn new(
        settings: PipelineSettings,
        dirs: Vec<ChannelDirs>,
        state: Arc<RecorderState>,
        metrics: SharedMetrics,
    ) -> Self {
        let failures = FailureLedger::new(settings.retry_backoff);
        Self {
            settings,
            dirs,
            state,
            metrics,
            failures,
        }
    }

    /// Failed attempts recorded for `path` since it last succeeded
    pub fn failed_attempts(&self, path: &Path) -> u32 {
        self.failures.attempts(path)
    }

    /// Process at most one pending file, only while no recording is active.
    pub async fn process_one_if_idle(&self) -> PipelineOutcome {
        if self.state.shutdown_token().is_cancelled() {
            return PipelineOutcome::ShuttingDown;
        }
        if !self.state.is_idle() {
            return PipelineOutcome::NotIdle;
        }

        // Reservations after this point abort the run
        let generation = self.state.sessions_started();

        let dirs = self.dirs.clone();
        let candidates = match tokio::task::spawn_blocking(move || scan_pending(&dirs)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Pending file scan panicked: {}", e);
                return PipelineOutcome::NothingPending;
            }
        };
        let waiting = candidates.len();
        let Some(pending) = self.failures.select(candidates, Instant::now()) else {
            if waiting > 0 {
                debug!(waiting, "Pending files are all backing off after failures");
            }
            return PipelineOutcome::NothingPending;
        };
        let source = pending.path.clone();

        match check_settled(&source, self.settings.settle_window).await {
            Ok(SettleResult::Settled { .. }) => {}
            Ok(SettleResult::Growing { .. }) => {
                debug!(path = %source.display(), "Pending file still growing, skipping");
                return PipelineOutcome::StillWriting(source);
            }
            Err(e) => {
                warn!(path = %source.display(), "Pending file vanished during settle check: {}", e);
                return PipelineOutcome::Failed {
                    source,
                    reason: e.to_string(),
                };
            }
        }

        if self.recording_started_since(generation) {
            info!(path = %source.display(), "Recording started, postponing processing");
            return PipelineOutcome::Aborted(source);
        }

        let Some(dirs) = self.dirs.iter().find(|d| d.channel == pending.channel) else {
            return PipelineOutcome::Failed {
                source,
                reason: format!("no directories for channel {}", pending.channel),
            };
        };
        let Some(file_name) = pending.file_name() else {
            return PipelineOutcome::Failed {
                source,
                reason: "pending file has no name".to_string(),
            };
        };
        let output = dirs.processed.join(file_name);

        let result = if self.settings.disable_transcode {
            self.move_raw(&source, &output).await
        } else {
            self.transcode(&pending, &output, generation).await
        };

        match result {
            Ok(()) => {}
            Err(StepError::Interrupted) => {
                info!(path = %source.display(), "Processing interrupted, raw file kept");
                return PipelineOutcome::Aborted(source);
            }
            Err(StepError::Failed(reason)) => {
                let attempts = self.failures.record_failure(&source, Instant::now());
                if let Some(retry_at) = self.failures.retry_at(&source) {
                    let retry_in = retry_at.saturating_duration_since(Instant::now());
                    warn!(
                        path = %source.display(),
                        attempts,
                        ?retry_in,
                        "Processing failed, raw file kept"
                    );
                }
                return PipelineOutcome::Failed { source, reason };
            }
        }
        self.failures.clear(&source);

        let mirrored = match &self.settings.mirror_root {
            Some(root) => self.mirror(&output, &dirs.mirror_dir(root)).await,
            None => None,
        };

        self.metrics.write().await.processed_files += 1;
        info!(
            channel = %pending.channel,
            output = %output.display(),
            "Processed recording"
        );
        PipelineOutcome::Processed {
            source,
            output,
            mirrored,
        }
    }

    fn recording_started_since(&self, generation: u64) -> bool {
        !self.state.is_idle() || self.state.sessions_started() != generation
    }

    async fn move_raw(&self, source: &Path, output: &Path) -> Result<(), StepError> {
        let (src, dest) = (source.to_path_buf(), output.to_path_buf());
        match tokio::task::spawn_blocking(move || move_file(&src, &dest)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(path = %source.display(), "Failed to move recording: {}", e);
                Err(StepError::Failed(e.to_string()))
            }
            Err(e) => Err(StepError::Failed(format!("move task failed: {}", e))),
        }
    }

    async fn transcode(
        &self,
        pending: &PendingFile,
        output: &Path,
        generation: u64,
    ) -> Result<(), StepError> {
        let params = TranscodeParams {
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
            input_path: pending.path.clone(),
            output_path: output.to_path_buf(),
        };
        let timeout = transcode_timeout(pending.size_bytes);

        let interrupt = self.state.shutdown_token().child_token();
        let watcher =
            spawn_interrupt_watcher(Arc::clone(&self.state), generation, interrupt.clone());
        info!(input = %params.input_path.display(), ?timeout, "Transcoding recording");
        let result = run_transcode(&params, timeout, &interrupt).await;
        watcher.abort();

        match result {
            Ok(()) => {
                if let Err(e) = tokio::fs::remove_file(&pending.path).await {
                    warn!(path = %pending.path.display(), "Failed to remove raw recording: {}", e);
                }
                Ok(())
            }
            Err(TranscodeError::Terminated) => Err(StepError::Interrupted),
            Err(e) => {
                error!(path = %pending.path.display(), "Transcode failed, will retry later: {}", e);
                self.metrics.write().await.failed_transcodes += 1;
                Err(StepError::Failed(e.to_string()))
            }
        }
    }

    async fn mirror(&self, output: &Path, mirror_dir: &Path) -> Option<PathBuf> {
        let (src, dest) = (output.to_path_buf(), mirror_dir.to_path_buf());
        match tokio::task::spawn_blocking(move || mirror_file(&src, &dest)).await {
            Ok(Ok(copied)) => {
                debug!(path = %copied.display(), "Mirrored processed file");
                Some(copied)
            }
            Ok(Err(e)) => {
                error!(path = %output.display(), "Mirror copy failed: {}", e);
                self.metrics.write().await.mirror_failures += 1;
                None
            }
            Err(e) => {
                error!("Mirror task failed: {}", e);
                self.metrics.write().await.mirror_failures += 1;
                None
            }
        }
    }
}

enum StepError {
    Interrupted,
    Failed(String),
}

/// Cancel `interrupt` as soon as a recording is reserved.
fn spawn_interrupt_watcher(
    state: Arc<RecorderState>,
    generation: u64,
    interrupt: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = state.session_started();
        tokio::pin!(started);
        started.as_mut().enable();
        if state.sessions_started() == generation {
            started.await;
        }
        interrupt.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        dirs: Vec<ChannelDirs>,
        state: Arc<RecorderState>,
        metrics: SharedMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            let dirs = vec![ChannelDirs::new(&root, "alice")];
            fs::create_dir_all(&dirs[0].recorded).unwrap();
            fs::create_dir_all(&dirs[0].processed).unwrap();
            Self {
                _temp: temp,
                root,
                dirs,
                state: RecorderState::new(2, CancellationToken::new()),
                metrics: new_shared_metrics(),
            }
        }

        fn settings(&self, ffmpeg: PathBuf, disable_transcode: bool) -> PipelineSettings {
            PipelineSettings {
                ffmpeg_path: ffmpeg,
                disable_transcode,
                settle_window: Duration::from_millis(20),
                mirror_root: None,
                retry_backoff: Duration::from_secs(3600),
            }
        }

        fn pipeline(&self, settings: PipelineSettings) -> ProcessingPipeline {
            ProcessingPipeline::new(
                settings,
                self.dirs.clone(),
                Arc::clone(&self.state),
                self.metrics.clone(),
            )
        }

        fn raw(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dirs[0].recorded.join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(fx.settings(PathBuf::from("ffmpeg"), true));
        assert_eq!(pipeline.process_one_if_idle().await, PipelineOutcome::NothingPending);
    }

    #[tokio::test]
    async fn test_move_when_transcode_disabled() {
        let fx = Fixture::new();
        let content = b"raw stream bytes".to_vec();
        let raw = fx.raw("alice - 2024-01-01 00h00m00s - Test Stream.mp4", &content);
        let pipeline = fx.pipeline(fx.settings(PathBuf::from("ffmpeg"), true));

        let outcome = pipeline.process_one_if_idle().await;

        let expected = fx.dirs[0]
            .processed
            .join("alice - 2024-01-01 00h00m00s - Test Stream.mp4");
        assert_eq!(
            outcome,
            PipelineOutcome::Processed {
                source: raw.clone(),
                output: expected.clone(),
                mirrored: None
            }
        );
        assert!(!raw.exists());
        assert_eq!(fs::read(&expected).unwrap(), content);
        assert_eq!(fx.metrics.read().await.processed_files, 1);
    }

    #[tokio::test]
    async fn test_one_file_per_invocation() {
        let fx = Fixture::new();
        fx.raw("a.mp4", b"a");
        let second = fx.raw("b.mp4", b"b");
        let pipeline = fx.pipeline(fx.settings(PathBuf::from("ffmpeg"), true));

        assert!(matches!(
            pipeline.process_one_if_idle().await,
            PipelineOutcome::Processed { .. }
        ));
        assert!(second.exists());
        assert!(matches!(
            pipeline.process_one_if_idle().await,
            PipelineOutcome::Processed { .. }
        ));
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_not_idle_touches_nothing() {
        let fx = Fixture::new();
        let raw = fx.raw("a.mp4", b"data");
        let _slot = fx.state.try_reserve("bob").unwrap();
        let pipeline = fx.pipeline(fx.settings(PathBuf::from("ffmpeg"), true));

        assert_eq!(pipeline.process_one_if_idle().await, PipelineOutcome::NotIdle);
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_recording_started_during_settle_aborts() {
        let fx = Fixture::new();
        let raw = fx.raw("a.mp4", b"data");
        let mut settings = fx.settings(PathBuf::from("ffmpeg"), true);
        settings.settle_window = Duration::from_millis(300);
        let pipeline = fx.pipeline(settings);

        let state = Arc::clone(&fx.state);
        let starter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // A session that starts and ends within the window still aborts the run
            drop(state.try_reserve("bob").unwrap());
        });

        let outcome = pipeline.process_one_if_idle().await;
        starter.await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Aborted(raw.clone()));
        assert!(raw.exists());
        assert!(fs::read_dir(&fx.dirs[0].processed).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_growing_file_is_skipped() {
        let fx = Fixture::new();
        let raw = fx.raw("a.mp4", b"data");
        let mut settings = fx.settings(PathBuf::from("ffmpeg"), true);
        settings.settle_window = Duration::from_millis(300);
        let pipeline = fx.pipeline(settings);

        let writer_path = raw.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(&writer_path, b"data and more").unwrap();
        });

        let outcome = pipeline.process_one_if_idle().await;
        writer.await.unwrap();
        assert_eq!(outcome, PipelineOutcome::StillWriting(raw.clone()));
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_mirror_copy() {
        let fx = Fixture::new();
        fx.raw("a.mp4", b"mirror me");
        let mut settings = fx.settings(PathBuf::from("ffmpeg"), true);
        let mirror_root = fx.root.join("nas");
        settings.mirror_root = Some(mirror_root.clone());
        let pipeline = fx.pipeline(settings);

        let outcome = pipeline.process_one_if_idle().await;

        let mirrored = mirror_root.join("alice").join("a.mp4");
        match outcome {
            PipelineOutcome::Processed { mirrored: Some(path), .. } => assert_eq!(path, mirrored),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fs::read(&mirrored).unwrap(), b"mirror me");
    }

    #[tokio::test]
    async fn test_mirror_failure_is_not_fatal() {
        let fx = Fixture::new();
        fx.raw("a.mp4", b"data");
        // A regular file where the mirror directory should be
        let blocker = fx.root.join("nas");
        fs::write(&blocker, b"not a directory").unwrap();
        let mut settings = fx.settings(PathBuf::from("ffmpeg"), true);
        settings.mirror_root = Some(blocker);
        let pipeline = fx.pipeline(settings);

        let outcome = pipeline.process_one_if_idle().await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Processed { mirrored: None, .. }
        ));
        let snapshot = fx.metrics.read().await;
        assert_eq!(snapshot.mirror_failures, 1);
        assert_eq!(snapshot.processed_files, 1);
    }

    #[tokio::test]
    async fn test_shutdown_skips_processing() {
        let fx = Fixture::new();
        let raw = fx.raw("a.mp4", b"data");
        fx.state.shutdown_token().cancel();
        let pipeline = fx.pipeline(fx.settings(PathBuf::from("ffmpeg"), true));

        assert_eq!(pipeline.process_one_if_idle().await, PipelineOutcome::ShuttingDown);
        assert!(raw.exists());
    }

    #[cfg(unix)]
    mod transcoding {
        use super::*;
        use crate::recorder::test_support::write_script;

        #[tokio::test]
        async fn test_transcode_success_removes_raw() {
            let fx = Fixture::new();
            let raw = fx.raw("a.mp4", b"raw");
            let ffmpeg = write_script(&fx.root, "ffmpeg", "printf 'transcoded' > \"$OUT\"");
            let pipeline = fx.pipeline(fx.settings(ffmpeg, false));

            let outcome = pipeline.process_one_if_idle().await;

            let output = fx.dirs[0].processed.join("a.mp4");
            assert!(matches!(outcome, PipelineOutcome::Processed { .. }));
            assert!(!raw.exists());
            assert_eq!(fs::read(&output).unwrap(), b"transcoded");
        }

        #[tokio::test]
        async fn test_transcode_failure_keeps_raw() {
            let fx = Fixture::new();
            let raw = fx.raw("a.mp4", b"raw");
            let ffmpeg = write_script(&fx.root, "ffmpeg", "echo 'Invalid data' >&2\nexit 1");
            let pipeline = fx.pipeline(fx.settings(ffmpeg, false));

            let outcome = pipeline.process_one_if_idle().await;

            assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
            assert!(raw.exists());
            assert_eq!(fx.metrics.read().await.failed_transcodes, 1);
        }

        /// ffmpeg stub that rejects `a.mp4` and transcodes anything else
        fn picky_ffmpeg(fx: &Fixture) -> PathBuf {
            write_script(
                &fx.root,
                "ffmpeg",
                "case \"$*\" in *'/a.mp4'*) echo 'Invalid data' >&2; exit 1;; esac\n\
                 printf 'transcoded' > \"$OUT\"",
            )
        }

        #[tokio::test]
        async fn test_failing_file_does_not_block_others() {
            let fx = Fixture::new();
            let bad = fx.raw("a.mp4", b"corrupt");
            let good = fx.raw("b.mp4", b"raw");
            let pipeline = fx.pipeline(fx.settings(picky_ffmpeg(&fx), false));

            let first = pipeline.process_one_if_idle().await;
            assert!(
                matches!(&first, PipelineOutcome::Failed { source, .. } if *source == bad),
                "unexpected outcome: {:?}",
                first
            );
            assert_eq!(pipeline.failed_attempts(&bad), 1);

            let second = pipeline.process_one_if_idle().await;
            assert!(
                matches!(&second, PipelineOutcome::Processed { source, .. } if *source == good),
                "unexpected outcome: {:?}",
                second
            );
            assert!(!good.exists());
            assert_eq!(fs::read(fx.dirs[0].processed.join("b.mp4")).unwrap(), b"transcoded");

            // The failed file waits out its backoff
            assert_eq!(pipeline.process_one_if_idle().await, PipelineOutcome::NothingPending);
            assert!(bad.exists());
            let snapshot = fx.metrics.read().await;
            assert_eq!(snapshot.failed_transcodes, 1);
            assert_eq!(snapshot.processed_files, 1);
        }

        #[tokio::test]
        async fn test_failing_file_rotates_behind_others_without_backoff() {
            let fx = Fixture::new();
            let bad = fx.raw("a.mp4", b"corrupt");
            let good = fx.raw("b.mp4", b"raw");
            let mut settings = fx.settings(picky_ffmpeg(&fx), false);
            settings.retry_backoff = Duration::ZERO;
            let pipeline = fx.pipeline(settings);

            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(pipeline.process_one_if_idle().await);
            }

            assert!(matches!(
                &outcomes[0],
                PipelineOutcome::Failed { source, .. } if *source == bad
            ));
            assert!(matches!(
                &outcomes[1],
                PipelineOutcome::Processed { source, .. } if *source == good
            ));
            assert!(matches!(
                &outcomes[2],
                PipelineOutcome::Failed { source, .. } if *source == bad
            ));
            assert_eq!(pipeline.failed_attempts(&bad), 2);
            assert!(bad.exists());
        }

        #[tokio::test]
        async fn test_recording_start_interrupts_transcode() {
            let fx = Fixture::new();
            let raw = fx.raw("a.mp4", b"raw");
            let ffmpeg = write_script(&fx.root, "ffmpeg", "exec sleep 30");
            let pipeline = fx.pipeline(fx.settings(ffmpeg, false));

            let state = Arc::clone(&fx.state);
            let starter = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                state.try_reserve("bob").unwrap()
            });

            let outcome =
                tokio::time::timeout(Duration::from_secs(5), pipeline.process_one_if_idle())
                    .await
                    .expect("transcode should be interrupted");
            let _slot = starter.await.unwrap();

            assert_eq!(outcome, PipelineOutcome::Aborted(raw.clone()));
            assert!(raw.exists());
            assert_eq!(fx.metrics.read().await.failed_transcodes, 0);
        }
    }
}
