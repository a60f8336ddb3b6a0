//! Write-settle check for pending files.
//!
//! A pending file is only handed to the pipeline when its size is unchanged
//! across two samples taken a settle window apart.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Default gap between the two size samples
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(1);

/// Result of a settle check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResult {
    /// Size unchanged across the window.
    Settled { size: u64 },
    /// Size changed; the file is still being written.
    Growing {
        initial_size: u64,
        current_size: u64,
    },
}

/// Sample the size of `path`, wait `window`, sample again.
pub async fn check_settled(path: &Path, window: Duration) -> Result<SettleResult, std::io::Error> {
    let initial_size = tokio::fs::metadata(path).await?.len();
    sleep(window).await;
    let current_size = tokio::fs::metadata(path).await?.len();
    Ok(compare_sizes(initial_size, current_size))
}

/// Pure comparison behind [`check_settled`].
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> SettleResult {
    if initial_size == current_size {
        SettleResult::Settled { size: current_size }
    } else {
        SettleResult::Growing {
            initial_size,
            current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::TempDir;

    // Property: a file is settled exactly when both samples agree.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_settle_size_comparison(initial_size: u64, current_size: u64) {
            match compare_sizes(initial_size, current_size) {
                SettleResult::Settled { size } => {
                    prop_assert_eq!(initial_size, current_size);
                    prop_assert_eq!(size, current_size);
                }
                SettleResult::Growing { initial_size: i, current_size: c } => {
                    prop_assert_ne!(initial_size, current_size);
                    prop_assert_eq!(i, initial_size);
                    prop_assert_eq!(c, current_size);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_quiet_file_is_settled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.mp4");
        std::fs::write(&path, b"finished").unwrap();

        let result = check_settled(&path, Duration::from_millis(20)).await.unwrap();
        assert_eq!(result, SettleResult::Settled { size: 8 });
    }

    #[tokio::test]
    async fn test_file_written_during_window_is_growing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.mp4");
        std::fs::write(&path, b"first").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .unwrap();
            f.write_all(b"-second").unwrap();
        });

        let result = check_settled(&path, Duration::from_millis(200)).await.unwrap();
        writer.await.unwrap();
        assert_eq!(
            result,
            SettleResult::Growing {
                initial_size: 5,
                current_size: 12
            }
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(check_settled(&temp_dir.path().join("gone.mp4"), Duration::ZERO)
            .await
            .is_err());
    }
}
