//! # Block Download Runtime
//!
//! Wires the block downloader to an in-process event bus.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (file named by `QC_DOWNLOAD_CONFIG`, then `QC_*` env)
//! 2. Create the event bus, the peer stream registry and the clock
//! 3. Spawn the download service
//! 4. Announce `NetStarted` and queue the configured initial blocks
//! 5. Log download outcomes from the bus as they are published
//!
//! The connection and wire layers publish onto [`DownloadRuntime::bus`] and
//! keep the stream registry from [`DownloadRuntime::streams`] up to date.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use qc_block_download::adapters::{InMemoryPeerStreams, SystemTimeSource};
use qc_block_download::{BlockDownloadApi, DownloadHandle, DownloadRequest, DownloadService};
use shared_bus::{EventFilter, EventPublisher, EventStream, EventTopic, InMemoryEventBus, NetworkEvent};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{info, warn};

pub use config::RuntimeConfig;

/// How long shutdown waits for the service task.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The running downloader and the infrastructure it is attached to.
pub struct DownloadRuntime {
    bus: Arc<InMemoryEventBus>,
    streams: Arc<InMemoryPeerStreams>,
    handle: DownloadHandle,
    service: JoinHandle<()>,
    outcomes: JoinHandle<usize>,
}

impl DownloadRuntime {
    /// Spawn the download service. Must be called inside a tokio runtime.
    pub fn start(config: &RuntimeConfig) -> Result<Self> {
        let bus = Arc::new(InMemoryEventBus::new());
        let streams = Arc::new(InMemoryPeerStreams::new());

        let (service, handle) = DownloadService::new(
            config.download.clone(),
            bus.clone(),
            streams.clone(),
            Arc::new(SystemTimeSource),
        )
        .context("Failed to create block download service")?;
        let service = tokio::spawn(service.run());
        let outcomes = tokio::spawn(log_outcomes(
            bus.event_stream(EventFilter::topics(vec![EventTopic::Download])),
        ));

        info!(
            max_peers = config.download.max_peers_downloading,
            max_mb = config.download.max_mb_in_parallel,
            criteria = ?config.download.criteria,
            "Block download runtime started"
        );

        Ok(Self {
            bus,
            streams,
            handle,
            service,
            outcomes,
        })
    }

    /// Announce the session and queue the configured blocks.
    pub async fn begin_session(&self, config: &RuntimeConfig) -> Result<()> {
        let receivers = self.bus.publish(NetworkEvent::NetStarted).await;
        info!(receivers, "Network session started");

        if !config.initial_blocks.is_empty() {
            self.handle
                .download(DownloadRequest::new(config.initial_blocks.clone()))
                .await
                .context("Failed to queue initial blocks")?;
            info!(count = config.initial_blocks.len(), "Initial blocks queued");
        }
        Ok(())
    }

    /// Client handle of the download service.
    pub fn handle(&self) -> DownloadHandle {
        self.handle.clone()
    }

    /// The event bus the downloader listens on.
    pub fn bus(&self) -> Arc<InMemoryEventBus> {
        self.bus.clone()
    }

    /// Stream registry the wire layer keeps current.
    pub fn streams(&self) -> Arc<InMemoryPeerStreams> {
        self.streams.clone()
    }

    /// Log a JSON snapshot of the download state.
    pub async fn log_state(&self) -> Result<()> {
        let state = self
            .handle
            .state()
            .await
            .context("Failed to query download state")?;
        let json = serde_json::to_string(&state).context("Failed to encode download state")?;
        info!(
            pending = state.pending.len(),
            in_flight = state.assigned().len(),
            downloaded = state.downloaded.len(),
            "Download state: {json}"
        );
        Ok(())
    }

    /// Stop the session and wait for the service to exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down block download runtime");
        self.bus.publish(NetworkEvent::NetStopped).await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.service).await {
            Ok(joined) => joined.context("Download service task failed")?,
            Err(_) => warn!("Download service did not stop in time"),
        }
        self.outcomes.abort();
        info!("Block download runtime stopped");
        Ok(())
    }
}

/// Log every download outcome published on the bus until the bus closes.
pub async fn log_outcomes(mut outcomes: EventStream) -> usize {
    let mut logged = 0;
    while let Some(event) = outcomes.next().await {
        match event {
            NetworkEvent::BlockDownloaded {
                peer,
                header,
                block_size,
                duration_ms,
            } => info!(
                peer = %peer,
                block = %header.hash,
                block_size,
                duration_ms,
                "Block downloaded"
            ),
            NetworkEvent::BlockDiscarded { block_hash, reason } => {
                warn!(block = %block_hash, reason = %reason, "Block discarded")
            }
            _ => continue,
        }
        logged += 1;
    }
    logged
}
