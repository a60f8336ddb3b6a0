//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but violates an invariant
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Smallest accepted polling interval.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Recording and processing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    /// Root directory holding `recorded/` and `processed/`
    #[serde(default)]
    pub root_path: PathBuf,
    /// Recorder binary (streamlink compatible)
    #[serde(default = "default_streamlink_path")]
    pub streamlink_path: PathBuf,
    /// Transcoder binary (ffmpeg compatible)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Move raw files instead of repairing them with ffmpeg
    #[serde(default)]
    pub disable_transcode: bool,
    /// Seconds between scheduling cycles (>= 10)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Quality used for channels that do not set their own
    #[serde(default = "default_stream_quality")]
    pub stream_quality: String,
    /// How many times the recorder retries opening the stream
    #[serde(default = "default_retry_open")]
    pub retry_open: u32,
}

fn default_streamlink_path() -> PathBuf {
    PathBuf::from("streamlink")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_stream_quality() -> String {
    "best".to_string()
}

fn default_retry_open() -> u32 {
    3
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::new(),
            streamlink_path: default_streamlink_path(),
            ffmpeg_path: default_ffmpeg_path(),
            disable_transcode: false,
            refresh_interval_secs: default_refresh_interval_secs(),
            stream_quality: default_stream_quality(),
            retry_open: default_retry_open(),
        }
    }
}

/// Admission and probing limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum recordings running at the same time (>= 1)
    #[serde(default = "default_max_concurrent_recordings")]
    pub max_concurrent_recordings: u32,
    /// CPU usage above which new recordings are deferred
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f32,
    /// Memory usage above which new recordings are deferred
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f32,
    /// CPU usage above which a whole probing cycle is skipped
    #[serde(default = "default_probe_cpu_threshold_percent")]
    pub probe_cpu_threshold_percent: f32,
    /// Free space required on the recording volume
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
}

fn default_max_concurrent_recordings() -> u32 {
    2
}

fn default_cpu_threshold_percent() -> f32 {
    80.0
}

fn default_memory_threshold_percent() -> f32 {
    80.0
}

fn default_probe_cpu_threshold_percent() -> f32 {
    50.0
}

fn default_min_free_disk_bytes() -> u64 {
    1 << 30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recordings: default_max_concurrent_recordings(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
            memory_threshold_percent: default_memory_threshold_percent(),
            probe_cpu_threshold_percent: default_probe_cpu_threshold_percent(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
        }
    }
}

/// Age-based pruning of raw and processed files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Files older than this many whole days are deleted
    #[serde(default = "default_prune_after_days")]
    pub prune_after_days: u64,
    /// Seconds between retention sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_prune_after_days() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            prune_after_days: default_prune_after_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Optional offsite copy of processed files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Destination directory (network drive, second disk, ...)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Twitch API credentials and endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwitchConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_streams_url")]
    pub streams_url: String,
}

fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

fn default_streams_url() -> String {
    "https://api.twitch.tv/helix/streams".to_string()
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: default_token_url(),
            streams_url: default_streams_url(),
        }
    }
}

/// Status HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_listen")]
    pub listen: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_listen() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            listen: default_status_listen(),
        }
    }
}

/// One monitored channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    /// Overrides `recorder.stream_quality` for this channel
    #[serde(default)]
    pub quality: Option<String>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quality: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Login names are ASCII letters, digits and underscores.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TWITCH_CLIENT_ID -> twitch.client_id
    /// - TWITCH_CLIENT_SECRET -> twitch.client_secret
    /// - RECORDER_ROOT_PATH -> recorder.root_path
    /// - RECORDER_CHANNELS -> channels (comma-separated, replaces the list)
    /// - RECORDER_STREAM_QUALITY -> recorder.stream_quality
    /// - RECORDER_DISABLE_TRANSCODE -> recorder.disable_transcode
    /// - RECORDER_MAX_CONCURRENT_RECORDINGS -> limits.max_concurrent_recordings
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TWITCH_CLIENT_ID") {
            self.twitch.client_id = val;
        }

        if let Ok(val) = env::var("TWITCH_CLIENT_SECRET") {
            self.twitch.client_secret = val;
        }

        if let Ok(val) = env::var("RECORDER_ROOT_PATH") {
            self.recorder.root_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RECORDER_CHANNELS") {
            self.set_channel_names(&val);
        }

        if let Ok(val) = env::var("RECORDER_STREAM_QUALITY") {
            self.recorder.stream_quality = val;
        }

        if let Ok(val) = env::var("RECORDER_DISABLE_TRANSCODE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.recorder.disable_transcode = true,
                "false" | "0" | "no" => self.recorder.disable_transcode = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("RECORDER_MAX_CONCURRENT_RECORDINGS") {
            if let Ok(max) = val.parse::<u32>() {
                self.limits.max_concurrent_recordings = max;
            }
        }
    }

    /// Replace the channel list from a comma-separated list of names.
    ///
    /// Blank entries are dropped; per-channel quality overrides are lost.
    pub fn set_channel_names(&mut self, list: &str) {
        self.channels = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ChannelConfig::new)
            .collect();
    }

    /// Quality string for a channel, falling back to `recorder.stream_quality`.
    pub fn quality_for<'a>(&'a self, channel: &'a ChannelConfig) -> &'a str {
        channel
            .quality
            .as_deref()
            .unwrap_or(&self.recorder.stream_quality)
    }

    /// Check the invariants the daemon relies on.
    ///
    /// Channel names become directory names under `root_path`, so they are
    /// limited to the login-name alphabet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.channels.is_empty() {
            return invalid("at least one channel must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return invalid("channel names must not be empty".to_string());
            }
            if !is_valid_channel_name(&channel.name) {
                return invalid(format!(
                    "channel '{}' may only contain letters, digits and '_'",
                    channel.name
                ));
            }
            if !seen.insert(channel.name.to_lowercase()) {
                return invalid(format!("channel '{}' is configured twice", channel.name));
            }
        }

        if self.twitch.client_id.is_empty() || self.twitch.client_secret.is_empty() {
            return invalid("twitch.client_id and twitch.client_secret are required".to_string());
        }

        if self.recorder.root_path.as_os_str().is_empty() {
            return invalid("recorder.root_path is required".to_string());
        }

        if self.recorder.refresh_interval_secs < MIN_REFRESH_INTERVAL_SECS {
            return invalid(format!(
                "recorder.refresh_interval_secs must be >= {}, got {}",
                MIN_REFRESH_INTERVAL_SECS, self.recorder.refresh_interval_secs
            ));
        }

        if self.limits.max_concurrent_recordings < 1 {
            return invalid("limits.max_concurrent_recordings must be >= 1".to_string());
        }

        for (key, value) in [
            ("cpu_threshold_percent", self.limits.cpu_threshold_percent),
            ("memory_threshold_percent", self.limits.memory_threshold_percent),
            ("probe_cpu_threshold_percent", self.limits.probe_cpu_threshold_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return invalid(format!("limits.{} must be in (0, 100], got {}", key, value));
            }
        }

        if self.mirror.enabled && self.mirror.path.is_none() {
            return invalid("mirror.path is required when mirror.enabled is true".to_string());
        }

        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
