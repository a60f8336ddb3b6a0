//! FFmpeg repair/transcode step
//!
//! Recordings are re-encoded to H.264/AAC with error-tolerant decoding so that
//! damaged segments from a dropped stream do not abort the whole file.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lower bound for the transcode timeout
pub const MIN_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timeout budget per MiB of input
pub const TIMEOUT_PER_MIB: Duration = Duration::from_secs(1);

const CRF: &str = "23";
const PRESET: &str = "veryfast";
const MAX_VIDEO_RATE: &str = "6M";
const VIDEO_BUFSIZE: &str = "12M";
const AUDIO_BITRATE: &str = "160k";

/// Error type for transcode operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// FFmpeg exited with non-zero status
    #[error("FFmpeg failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    /// Transcode was stopped before completion
    #[error("FFmpeg was interrupted")]
    Terminated,

    /// Transcode ran past its time budget
    #[error("FFmpeg timed out after {0:?}")]
    TimedOut(Duration),

    /// IO error launching or waiting on FFmpeg
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one transcode
#[derive(Debug, Clone)]
pub struct TranscodeParams {
    pub ffmpeg_path: PathBuf,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// max(1h, 1s per MiB of input)
pub fn transcode_timeout(input_bytes: u64) -> Duration {
    let mib = u32::try_from(input_bytes / (1024 * 1024)).unwrap_or(u32::MAX);
    let scaled = TIMEOUT_PER_MIB.saturating_mul(mib);
    scaled.max(MIN_TRANSCODE_TIMEOUT)
}

/// Build the ffmpeg command line for a repair/transcode.
pub fn build_ffmpeg_command(params: &TranscodeParams) -> Command {
    let mut cmd = Command::new(&params.ffmpeg_path);

    cmd.arg("-hide_banner").arg("-nostdin");
    cmd.arg("-loglevel").arg("error");

    // Error-tolerant input
    cmd.arg("-err_detect").arg("ignore_err");
    cmd.arg("-fflags").arg("+discardcorrupt+genpts");
    cmd.arg("-i").arg(&params.input_path);

    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg(PRESET);
    cmd.arg("-crf").arg(CRF);
    cmd.arg("-maxrate").arg(MAX_VIDEO_RATE);
    cmd.arg("-bufsize").arg(VIDEO_BUFSIZE);

    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg(AUDIO_BITRATE);

    cmd.arg("-movflags").arg("+faststart");
    cmd.arg("-y").arg(&params.output_path);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd
}

/// Run ffmpeg until it exits, `interrupt` fires, or the timeout passes.
///
/// The process is killed on interrupt and timeout. Partial output is left
/// in place; `-y` overwrites it on the next attempt.
pub async fn run_transcode(
    params: &TranscodeParams,
    timeout: Duration,
    interrupt: &CancellationToken,
) -> Result<(), TranscodeError> {
    let child = build_ffmpeg_command(params).spawn()?;
    debug!(pid = ?child.id(), input = %params.input_path.display(), "FFmpeg started");

    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output?,
            Err(_) => {
                warn!(input = %params.input_path.display(), ?timeout, "FFmpeg timed out");
                return Err(TranscodeError::TimedOut(timeout));
            }
        },
        _ = interrupt.cancelled() => return Err(TranscodeError::Terminated),
    };

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TranscodeError::Failed {
            code: output.status.code(),
            stderr: stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | "),
        })
    }
}
