//! # Runtime Configuration
//!
//! Loaded from a TOML file (path in `QC_DOWNLOAD_CONFIG`), then overridden by
//! `QC_*` environment variables.
//!
//! ```toml
//! log_level = "debug"
//! state_log_interval_secs = 30
//! initial_blocks = ["00…01"]
//!
//! [download]
//! max_peers_downloading = 8
//!
//! [download.criteria]
//! kind = "announcers_only"
//! if_no_announcer = "download_from_anyone"
//! if_announcer_busy = "wait"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use qc_block_download::DownloadConfig;
use serde::{Deserialize, Serialize};
use shared_types::entities::BlockHash;
use tracing::warn;

/// Environment variable holding the config file path.
pub const CONFIG_PATH_ENV: &str = "QC_DOWNLOAD_CONFIG";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fallback log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Interval between two state snapshots in the log. 0 disables them.
    pub state_log_interval_secs: u64,
    /// Blocks queued for download at startup.
    pub initial_blocks: Vec<BlockHash>,
    /// Block downloader settings.
    pub download: DownloadConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_log_interval_secs: 60,
            initial_blocks: Vec::new(),
            download: DownloadConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid runtime configuration")
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
    }

    /// Load from the file named by [`CONFIG_PATH_ENV`] (defaults if unset),
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
            .download
            .validate()
            .context("Invalid block download configuration")?;
        Ok(config)
    }

    /// Override settings from `QC_*` variables resolved by `lookup`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("QC_LOG_LEVEL") {
            self.log_level = level;
        }
        override_number(&lookup, "QC_TICK_INTERVAL_MS", &mut self.download.tick_interval_ms);
        override_number(
            &lookup,
            "QC_MAX_PEERS_DOWNLOADING",
            &mut self.download.max_peers_downloading,
        );
        override_number(&lookup, "QC_MAX_MB_IN_PARALLEL", &mut self.download.max_mb_in_parallel);
        override_number(
            &lookup,
            "QC_MAX_DOWNLOAD_ATTEMPTS",
            &mut self.download.max_download_attempts,
        );
        override_number(
            &lookup,
            "QC_STATE_LOG_INTERVAL_SECS",
            &mut self.state_log_interval_secs,
        );
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "Ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.download.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = RuntimeConfig::from_toml(&format!(
            r#"
            log_level = "debug"
            initial_blocks = ["{}"]

            [download]
            max_peers_downloading = 3

            [download.history]
            clean_on_success = true
            "#,
            "ab".repeat(32)
        ))
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.initial_blocks, vec![BlockHash::new([0xAB; 32])]);
        assert_eq!(config.download.max_peers_downloading, 3);
        assert!(config.download.history.clean_on_success);
        assert!(config.download.history.enabled);
        assert_eq!(config.state_log_interval_secs, 60);
    }

    #[test]
    fn test_rejects_bad_block_hash() {
        assert!(RuntimeConfig::from_toml(r#"initial_blocks = ["xyz"]"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QC_LOG_LEVEL", "trace"),
            ("QC_MAX_PEERS_DOWNLOADING", "2"),
            ("QC_MAX_MB_IN_PARALLEL", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = RuntimeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.download.max_peers_downloading, 2);
        assert_eq!(config.download.max_mb_in_parallel, 100);
    }
}
