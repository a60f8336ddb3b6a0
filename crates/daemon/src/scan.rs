//! Discovery of pending files: finished raw recordings waiting in `recorded/<channel>`.
//!
//! Files left behind by a previous run are pending too, so a restart picks up
//! where the last one stopped.

use crate::layout::ChannelDirs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Suffix of in-flight copies, never treated as pending
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A raw recording awaiting processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub channel: String,
    pub path: PathBuf,
    /// Size in bytes at discovery time
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

impl PendingFile {
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }
}

/// Hidden files and in-flight copies are skipped.
pub fn is_candidate(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => !name.starts_with('.') && !name.ends_with(PARTIAL_SUFFIX),
        None => false,
    }
}

/// Non-empty files directly inside one directory, sorted by file name.
pub fn scan_directory(channel: &str, dir: &Path) -> Vec<PendingFile> {
    use walkdir::WalkDir;

    if !dir.exists() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_candidate(entry.path()))
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if metadata.len() == 0 {
                return None;
            }
            Some(PendingFile {
                channel: channel.to_string(),
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect()
}

/// All pending files: channels in configuration order, files by name.
pub fn scan_pending(dirs: &[ChannelDirs]) -> Vec<PendingFile> {
    dirs.iter()
        .flat_map(|d| scan_directory(&d.channel, &d.recorded))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn dirs_in(root: &Path, channels: &[&str]) -> Vec<ChannelDirs> {
        channels
            .iter()
            .map(|c| {
                let dirs = ChannelDirs::new(root, c);
                fs::create_dir_all(&dirs.recorded).unwrap();
                dirs
            })
            .collect()
    }

    #[test]
    fn test_is_candidate() {
        assert!(is_candidate(Path::new("/rec/alice - 2024-01-01 - title.mp4")));
        assert!(!is_candidate(Path::new("/rec/.hidden.mp4")));
        assert!(!is_candidate(Path::new("/rec/a.mp4.partial")));
    }

    #[test]
    fn test_scan_skips_empty_hidden_and_nested() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = dirs_in(temp_dir.path(), &["alice"]);
        let recorded = &dirs[0].recorded;

        fs::write(recorded.join("b.mp4"), b"data").unwrap();
        fs::write(recorded.join("a.mp4"), b"data").unwrap();
        fs::write(recorded.join("empty.mp4"), b"").unwrap();
        fs::write(recorded.join(".hidden.mp4"), b"data").unwrap();
        fs::create_dir_all(recorded.join("nested")).unwrap();
        fs::write(recorded.join("nested").join("c.mp4"), b"data").unwrap();

        let names: Vec<_> = scan_pending(&dirs)
            .into_iter()
            .map(|p| p.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4"]);
    }

    #[test]
    fn test_scan_follows_channel_order() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = dirs_in(temp_dir.path(), &["zed", "alice"]);
        fs::write(dirs[1].recorded.join("a.mp4"), b"data").unwrap();
        fs::write(dirs[0].recorded.join("z.mp4"), b"data").unwrap();

        let pending = scan_pending(&dirs);
        let channels: Vec<_> = pending.iter().map(|p| p.channel.as_str()).collect();
        assert_eq!(channels, vec!["zed", "alice"]);
        assert_eq!(pending[0].size_bytes, 4);
    }

    #[test]
    fn test_missing_directory_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = vec![ChannelDirs::new(temp_dir.path(), "ghost")];
        assert!(scan_pending(&dirs).is_empty());
    }

    // Property: discovery order is deterministic and sorted by name within a channel.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_scan_order_is_sorted(names in proptest::collection::btree_set("[a-z]{1,8}", 1..8)) {
            let temp_dir = TempDir::new().unwrap();
            let dirs = dirs_in(temp_dir.path(), &["alice"]);
            for name in &names {
                fs::write(dirs[0].recorded.join(format!("{}.mp4", name)), b"x").unwrap();
            }

            let first = scan_pending(&dirs);
            let second = scan_pending(&dirs);
            prop_assert_eq!(&first, &second);

            let found: Vec<_> = first.iter().map(|p| p.path.clone()).collect();
            let mut sorted = found.clone();
            sorted.sort();
            prop_assert_eq!(found, sorted);
            prop_assert_eq!(first.len(), names.len());
        }
    }
}
