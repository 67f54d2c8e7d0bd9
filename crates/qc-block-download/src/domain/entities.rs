//! # Domain Entities
//!
//! Download requests and the state snapshot exposed to callers.

use serde::{Deserialize, Serialize};
use shared_types::entities::{BlockHash, PeerAddress};

use super::peer::PeerSnapshot;
use super::policy::RejectionReason;

/// Request to download a batch of blocks.
///
/// ```rust
/// use qc_block_download::DownloadRequest;
/// use shared_types::entities::BlockHash;
///
/// let request = DownloadRequest::new(vec![BlockHash::new([1; 32])])
///     .with_priority()
///     .force();
/// assert!(request.priority && request.force_download);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Blocks to download, in order.
    pub hashes: Vec<BlockHash>,
    /// Put the blocks at the front of the backlog.
    pub priority: bool,
    /// Download again even if already downloaded.
    pub force_download: bool,
    /// Only this peer may download the blocks.
    pub exclusive_to_peer: Option<PeerAddress>,
    /// Prefer this peer when it is available.
    pub preferred_peer: Option<PeerAddress>,
}

impl DownloadRequest {
    /// A plain request for `hashes`.
    pub fn new(hashes: Vec<BlockHash>) -> Self {
        Self {
            hashes,
            priority: false,
            force_download: false,
            exclusive_to_peer: None,
            preferred_peer: None,
        }
    }

    /// Builder method: queue at the front.
    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Builder method: download again even if already downloaded.
    pub fn force(mut self) -> Self {
        self.force_download = true;
        self
    }

    /// Builder method: reserve the blocks to `peer`.
    pub fn exclusive_to(mut self, peer: PeerAddress) -> Self {
        self.exclusive_to_peer = Some(peer);
        self
    }

    /// Builder method: prefer `peer`.
    pub fn prefer(mut self, peer: PeerAddress) -> Self {
        self.preferred_peer = Some(peer);
        self
    }
}

/// Whether the coordinator hands out new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerState {
    /// Assigning blocks to idle peers.
    Running,
    /// Only finishing what is in flight.
    Paused,
}

/// One rejected (block, reason) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRejection {
    /// The block.
    pub block: BlockHash,
    /// Why the peer could not take it.
    pub reason: RejectionReason,
}

/// Rejections from the last scan of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRejections {
    /// The peer.
    pub peer: PeerAddress,
    /// Rejected blocks, in backlog order.
    pub rejections: Vec<BlockRejection>,
}

/// Snapshot of the downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadState {
    /// Running or paused.
    pub handler_state: HandlerState,
    /// Paused by the client.
    pub client_paused: bool,
    /// Enough handshaked peers are connected.
    pub enough_peers: bool,
    /// Backlog, in assignment order.
    pub pending: Vec<BlockHash>,
    /// Downloaded blocks.
    pub downloaded: Vec<BlockHash>,
    /// Blocks waiting for the discard cooldown.
    pub discarded: Vec<BlockHash>,
    /// Cancelled blocks.
    pub cancelled: Vec<BlockHash>,
    /// In-flight blocks cancelled by the client.
    pub pending_to_cancel: Vec<BlockHash>,
    /// Blocks whose attempt is being resolved.
    pub in_limbo: Vec<BlockHash>,
    /// Known peers, by address.
    pub peers: Vec<PeerSnapshot>,
    /// Blocks queued again after a failed attempt.
    pub total_reattempts: u64,
    /// Highest share of peers busy since the last snapshot, in percent.
    pub busy_percentage: u32,
    /// The bandwidth cap blocked new assignments on the last tick.
    pub bandwidth_restricted: bool,
    /// Bytes of blocks currently in flight.
    pub bytes_in_flight: u64,
    /// Last rejections per peer.
    pub rejections: Vec<PeerRejections>,
}

impl DownloadState {
    /// Blocks currently assigned to a peer.
    pub fn assigned(&self) -> Vec<BlockHash> {
        self.peers
            .iter()
            .filter_map(|p| p.progress.as_ref().map(|progress| progress.block_hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let peer: PeerAddress = "10.0.0.1:8333".parse().unwrap();
        let request = DownloadRequest::new(vec![BlockHash::default()])
            .exclusive_to(peer)
            .prefer(peer);
        assert!(!request.priority);
        assert!(!request.force_download);
        assert_eq!(request.exclusive_to_peer, Some(peer));
        assert_eq!(request.preferred_peer, Some(peer));
    }
}
