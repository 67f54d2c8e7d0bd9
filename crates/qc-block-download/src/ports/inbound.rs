//! # Inbound Ports
//!
//! API exposed by the block downloader to the rest of the node.

use async_trait::async_trait;
use shared_types::entities::BlockHash;

use crate::domain::{DownloadError, DownloadRequest, DownloadState, HistoryItem};

/// Block download API - inbound port.
#[async_trait]
pub trait BlockDownloadApi: Send + Sync {
    /// Queue blocks for download.
    async fn download(&self, request: DownloadRequest) -> Result<(), DownloadError>;

    /// Cancel the download of blocks. Cancelling twice is a no-op.
    async fn cancel_download(&self, hashes: Vec<BlockHash>) -> Result<(), DownloadError>;

    /// Stop assigning new blocks. In-flight downloads complete.
    async fn pause(&self) -> Result<(), DownloadError>;

    /// Resume assigning blocks.
    async fn resume(&self) -> Result<(), DownloadError>;

    /// Snapshot of the downloader state.
    ///
    /// Taking a snapshot resets the busy-percentage gauge.
    async fn state(&self) -> Result<DownloadState, DownloadError>;

    /// Diagnostic history of one block.
    async fn block_history(&self, hash: BlockHash) -> Result<Vec<HistoryItem>, DownloadError>;
}
