//! Concurrency planning module for the stream recorder
//!
//! Derives the probe worker pool size and recording cap from configuration.

use crate::config::Config;

/// Upper bound on probe tasks running at the same time
pub const MAX_PROBE_WORKERS: usize = 5;

/// Concurrency plan derived from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Number of configured channels
    pub channels: usize,
    /// Size of the probe worker pool
    pub probe_workers: usize,
    /// Maximum number of recordings running at once
    pub max_concurrent_recordings: usize,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - probe_workers = min(channels, 5), never below 1
    /// - max_concurrent_recordings is taken from `limits`, never below 1
    pub fn derive(cfg: &Config) -> Self {
        let channels = cfg.channels.len();
        Self {
            channels,
            probe_workers: probe_pool_size(channels),
            max_concurrent_recordings: (cfg.limits.max_concurrent_recordings as usize).max(1),
        }
    }
}

/// Probe pool size for a channel count
pub fn probe_pool_size(channels: usize) -> usize {
    channels.clamp(1, MAX_PROBE_WORKERS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use proptest::prelude::*;

    // Property: probe pool size is min(N, 5) for every N >= 1
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_probe_pool_is_bounded(
            channel_count in 1usize..64,
            max_recordings in 0u32..16,
        ) {
            let mut cfg = Config::default();
            cfg.channels = (0..channel_count)
                .map(|i| ChannelConfig::new(format!("chan{}", i)))
                .collect();
            cfg.limits.max_concurrent_recordings = max_recordings;

            let plan = derive_plan(&cfg);

            prop_assert_eq!(plan.channels, channel_count);
            prop_assert_eq!(plan.probe_workers, channel_count.min(5));
            prop_assert!(plan.probe_workers <= MAX_PROBE_WORKERS);
            prop_assert_eq!(plan.max_concurrent_recordings, (max_recordings as usize).max(1));
        }
    }

    #[test]
    fn test_empty_channel_list_still_has_one_worker() {
        assert_eq!(probe_pool_size(0), 1);
        assert_eq!(probe_pool_size(3), 3);
        assert_eq!(probe_pool_size(12), 5);
    }
}
