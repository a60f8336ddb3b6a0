//! Stream Recorder
//!
//! Background service that watches a list of channels, records them while they
//! are live, and post-processes finished recordings when the host is idle.

pub mod admission;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod failures;
pub mod layout;
pub mod metrics;
pub mod pipeline;
pub mod probe;
pub mod recorder;
pub mod retention;
pub mod scan;
pub mod stability;
pub mod startup;
pub mod state;
pub mod status_server;
pub mod token;
pub mod transfer;

pub use stream_recorder_config as config;
pub use stream_recorder_config::Config;
pub use admission::{
    AdmissionController, AdmissionDecision, DenyReason, ResourceSampler, SysinfoSampler,
};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{ChannelOutcome, CycleReport, Daemon, DaemonDeps, DaemonError, DaemonOptions};
pub use encode::{
    build_ffmpeg_command, run_transcode, transcode_timeout, TranscodeError, TranscodeParams,
};
pub use metrics::{
    new_shared_metrics, RecordingMetrics, SharedMetrics, StatusSnapshot, SystemMetrics,
    SystemMonitor,
};
pub use pipeline::{PipelineOutcome, PipelineSettings, ProcessingPipeline};
pub use probe::{probe_channel, HelixProbe, LivenessResult, StatusProbe};
pub use recorder::{record, RecordError, RecorderSettings, RecordingOutcome, RecordingRequest};
pub use startup::{run_startup_checks, StartupError};
pub use state::{RecorderState, SessionSlot};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use token::{Credential, TokenError, TokenFetcher, TokenManager};
pub use tokio_util::sync::CancellationToken;
