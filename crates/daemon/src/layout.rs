//! Filesystem layout: `<root>/recorded/<channel>` and `<root>/processed/<channel>`.

use crate::config::Config;
use std::path::{Path, PathBuf};

pub const RECORDED_DIR: &str = "recorded";
pub const PROCESSED_DIR: &str = "processed";

/// Raw and finished output directories for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDirs {
    pub channel: String,
    pub recorded: PathBuf,
    pub processed: PathBuf,
}

impl ChannelDirs {
    pub fn new(root: &Path, channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            recorded: root.join(RECORDED_DIR).join(channel),
            processed: root.join(PROCESSED_DIR).join(channel),
        }
    }

    /// Where a processed file lands in the mirror
    pub fn mirror_dir(&self, mirror_root: &Path) -> PathBuf {
        mirror_root.join(&self.channel)
    }
}

/// Directories for every configured channel, in configuration order
pub fn channel_dirs(cfg: &Config) -> Vec<ChannelDirs> {
    cfg.channels
        .iter()
        .map(|c| ChannelDirs::new(&cfg.recorder.root_path, &c.name))
        .collect()
}
