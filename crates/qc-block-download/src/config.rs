//! # Block Download Configuration
//!
//! Limits, timeouts and the peer-selection criteria of the block downloader.
//! Durations are stored as integer milliseconds so the structure maps
//! directly onto TOML/JSON configuration files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::ConfigError;

/// What to do with a block when the announcers-only criteria cannot pick an
/// announcer for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Let any peer download the block.
    DownloadFromAnyone,
    /// Keep the block pending until an announcer can take it.
    Wait,
}

/// Fallback behaviour of the announcers-only criteria.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncersPolicy {
    /// Applied when no peer that announced the block is connected.
    pub if_no_announcer: FallbackAction,
    /// Applied when every announcer is connected but busy downloading.
    pub if_announcer_busy: FallbackAction,
}

impl Default for AnnouncersPolicy {
    fn default() -> Self {
        Self {
            if_no_announcer: FallbackAction::DownloadFromAnyone,
            if_announcer_busy: FallbackAction::Wait,
        }
    }
}

/// Which peers may download a pending block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadCriteria {
    /// Any handshaked peer may download any pending block.
    #[default]
    AnyPeer,
    /// Only peers that announced the block, with configurable fallbacks.
    AnnouncersOnly(AnnouncersPolicy),
}

/// Per-block download history settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Record history at all.
    pub enabled: bool,
    /// History entries older than this are purged.
    pub retention_ms: u64,
    /// Purge expired entries every N ticks.
    pub cleanup_every_ticks: u64,
    /// Drop the history of a block as soon as it is downloaded.
    pub clean_on_success: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_ms: 60 * 60 * 1_000, // 1 hour
            cleanup_every_ticks: 100,
            clean_on_success: false,
        }
    }
}

impl HistoryConfig {
    /// Retention as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Block downloader configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Interval between two coordinator ticks.
    pub tick_interval_ms: u64,
    /// Maximum number of peers downloading a block at the same time.
    pub max_peers_downloading: usize,
    /// Maximum megabytes (1e6 bytes) of blocks in flight at the same time.
    pub max_mb_in_parallel: u64,
    /// A peer that sends no bytes for this long is considered stalled.
    pub max_idle_timeout_ms: u64,
    /// Maximum time a single download attempt may take.
    pub max_download_timeout_ms: u64,
    /// Attempts per block before it is discarded.
    pub max_download_attempts: u32,
    /// A block in limbo with no activity for this long fails definitively.
    pub inactivity_timeout_to_fail_ms: u64,
    /// Discarded blocks are retried after this long.
    pub retry_discarded_blocks_timeout_ms: u64,
    /// A peer that failed a block is not given that block again for this long.
    pub failure_cooldown_ms: u64,
    /// Peer selection criteria.
    pub criteria: DownloadCriteria,
    /// History settings.
    pub history: HistoryConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            max_peers_downloading: 10,
            max_mb_in_parallel: 100,
            max_idle_timeout_ms: 10_000,
            max_download_timeout_ms: 10 * 60 * 1_000, // 10 minutes
            max_download_attempts: 5,
            inactivity_timeout_to_fail_ms: 20_000,
            retry_discarded_blocks_timeout_ms: 10 * 60 * 1_000, // 10 minutes
            failure_cooldown_ms: 30_000,
            criteria: DownloadCriteria::AnyPeer,
            history: HistoryConfig::default(),
        }
    }
}

impl DownloadConfig {
    /// Create a config for testing (short timeouts, small limits).
    pub fn for_testing() -> Self {
        Self {
            tick_interval_ms: 10,
            max_peers_downloading: 4,
            max_mb_in_parallel: 10,
            max_idle_timeout_ms: 1_000,
            max_download_timeout_ms: 5_000,
            max_download_attempts: 3,
            inactivity_timeout_to_fail_ms: 2_000,
            retry_discarded_blocks_timeout_ms: 10_000,
            failure_cooldown_ms: 3_000,
            criteria: DownloadCriteria::AnyPeer,
            history: HistoryConfig {
                enabled: true,
                retention_ms: 60_000,
                cleanup_every_ticks: 10,
                clean_on_success: false,
            },
        }
    }

    /// Builder method: set the peer selection criteria.
    pub fn with_criteria(mut self, criteria: DownloadCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 7] = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("max_idle_timeout_ms", self.max_idle_timeout_ms),
            ("max_download_timeout_ms", self.max_download_timeout_ms),
            ("max_download_attempts", u64::from(self.max_download_attempts)),
            ("max_mb_in_parallel", self.max_mb_in_parallel),
            ("max_peers_downloading", self.max_peers_downloading as u64),
            ("history.cleanup_every_ticks", self.history.cleanup_every_ticks),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::MustBePositive { field });
        }
        if self.max_idle_timeout_ms > self.max_download_timeout_ms {
            return Err(ConfigError::Inconsistent(format!(
                "max_idle_timeout_ms ({}) exceeds max_download_timeout_ms ({})",
                self.max_idle_timeout_ms, self.max_download_timeout_ms
            )));
        }
        Ok(())
    }

    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Idle timeout as a [`Duration`].
    pub fn max_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.max_idle_timeout_ms)
    }

    /// Total download timeout as a [`Duration`].
    pub fn max_download_timeout(&self) -> Duration {
        Duration::from_millis(self.max_download_timeout_ms)
    }

    /// Limbo inactivity timeout as a [`Duration`].
    pub fn inactivity_timeout_to_fail(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_to_fail_ms)
    }

    /// Discard cooldown as a [`Duration`].
    pub fn retry_discarded_blocks_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_discarded_blocks_timeout_ms)
    }

    /// Per-peer failure cooldown as a [`Duration`].
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }

    /// Bandwidth cap in bytes.
    pub fn max_bytes_in_parallel(&self) -> u64 {
        self.max_mb_in_parallel.saturating_mul(1_000_000)
    }
}
