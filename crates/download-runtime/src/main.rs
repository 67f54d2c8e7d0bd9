//! # Block Download Runtime
//!
//! Entry point: load configuration, install logging, run the downloader
//! until Ctrl+C.

use std::time::Duration;

use anyhow::{Context, Result};
use download_runtime::{DownloadRuntime, RuntimeConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log filter")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = DownloadRuntime::start(&config)?;
    runtime.begin_session(&config).await?;

    info!("Block downloader is running. Press Ctrl+C to stop.");
    if config.state_log_interval_secs == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.state_log_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = runtime.log_state().await {
                        warn!("Failed to log download state: {e:#}");
                        break;
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
            }
        }
    }

    runtime.shutdown().await
}
