//! Startup checks for the stream recorder
//!
//! Preflight checks run before the first cycle:
//! - the recorder binary answers `--version`
//! - the transcoder answers `-version` (skipped when transcoding is disabled)
//! - per-channel `recorded/` and `processed/` directories exist
//! - the root path is writable

use crate::config::Config;
use crate::layout::{channel_dirs, ChannelDirs};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Recorder not available: {0}")]
    RecorderUnavailable(String),

    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Root path {path} is not writable: {source}")]
    RootNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// First non-empty line of a `--version` style output
pub fn parse_version_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Run `<program> <version_arg>` and return its version line.
fn probe_tool(program: &Path, version_arg: &str) -> Result<String, String> {
    let output = Command::new(program)
        .arg(version_arg)
        .output()
        .map_err(|e| {
            format!(
                "{} {} failed; is it installed and in PATH? Error: {}",
                program.display(),
                version_arg,
                e
            )
        })?;

    if !output.status.success() {
        return Err(format!(
            "{} {} exited with {}",
            program.display(),
            version_arg,
            output.status
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_version_line(&stdout)
        .unwrap_or("(unknown version)")
        .to_string())
}

/// Check that the recorder binary runs
pub fn check_recorder_available(cfg: &Config) -> Result<String, StartupError> {
    probe_tool(&cfg.recorder.streamlink_path, "--version")
        .map_err(StartupError::RecorderUnavailable)
}

/// Check that ffmpeg runs. Not needed when transcoding is disabled.
pub fn check_ffmpeg_available(cfg: &Config) -> Result<Option<String>, StartupError> {
    if cfg.recorder.disable_transcode {
        return Ok(None);
    }
    probe_tool(&cfg.recorder.ffmpeg_path, "-version")
        .map(Some)
        .map_err(StartupError::FfmpegUnavailable)
}

/// Create `recorded/<channel>` and `processed/<channel>` for every channel.
pub fn prepare_directories(cfg: &Config) -> Result<Vec<ChannelDirs>, StartupError> {
    let dirs = channel_dirs(cfg);
    for d in &dirs {
        for path in [&d.recorded, &d.processed] {
            fs::create_dir_all(path).map_err(|source| StartupError::CreateDir {
                path: path.clone(),
                source,
            })?;
        }
    }
    Ok(dirs)
}

/// Create and remove a probe file under `root`.
pub fn check_root_writable(root: &Path) -> Result<(), StartupError> {
    let probe = root.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
    let not_writable = |source| StartupError::RootNotWritable {
        path: root.to_path_buf(),
        source,
    };
    fs::write(&probe, b"").map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Directory layout
/// 2. Root writability
/// 3. Recorder availability
/// 4. FFmpeg availability
pub fn run_startup_checks(cfg: &Config) -> Result<Vec<ChannelDirs>, StartupError> {
    let dirs = prepare_directories(cfg)?;
    check_root_writable(&cfg.recorder.root_path)?;

    let recorder = check_recorder_available(cfg)?;
    info!(version = %recorder, "Recorder available");

    if let Some(ffmpeg) = check_ffmpeg_available(cfg)? {
        info!(version = %ffmpeg, "FFmpeg available");
    }

    Ok(dirs)
}
