//! CLI entry point for the stream recorder
//!
//! Parses command line arguments, loads configuration and runs the daemon until
//! SIGINT or SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use stream_recorder::config::ConfigError;
use stream_recorder::{CancellationToken, Config, Daemon};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Stream Recorder - record live channels and post-process them when idle
#[derive(Parser, Debug)]
#[command(name = "stream-recorder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Comma-separated channel list, replaces the configured channels
    #[arg(long)]
    channels: Option<String>,

    /// Default stream quality
    #[arg(short, long)]
    quality: Option<String>,

    /// Move finished recordings without transcoding
    #[arg(long)]
    disable_transcode: bool,

    /// Skip recorder and ffmpeg availability checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// File, then environment, then command line; validated last.
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load_from_file(&args.config)?;
    config.apply_env_overrides();

    if let Some(channels) = &args.channels {
        config.set_channel_names(channels);
    }
    if let Some(quality) = &args.quality {
        config.recorder.stream_quality = quality.clone();
    }
    if args.disable_transcode {
        config.recorder.disable_transcode = true;
    }

    config.validate()?;
    Ok(config)
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                        _ = term.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C");
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(config = %args.config.display(), "Stream recorder starting");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config, shutdown).await
    } else {
        Daemon::new(config, shutdown).await
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize recorder: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        probe_workers = daemon.plan.probe_workers,
        max_recordings = daemon.plan.max_concurrent_recordings,
        "Recorder initialized"
    );
    if daemon.config.status.enabled {
        info!("Status endpoint on http://{}/status", daemon.config.status.listen);
    }

    if let Err(e) = daemon.run_with_server().await {
        error!("Recorder error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
