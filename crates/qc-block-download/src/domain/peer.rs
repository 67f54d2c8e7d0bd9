//! # Peer Records
//!
//! Per-peer connection and working state, plus the live progress of the
//! block a peer is currently sending.
//!
//! ```text
//! connection:  Connected ──▶ Handshaked ──▶ Disconnected
//! working:     Idle ◀──▶ Processing ──▶ Discarded
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared_types::entities::{BlockHash, PeerAddress, Timestamp};

use crate::ports::{StreamSnapshot, StreamState};

/// Speed assigned to a peer that never delivered a block.
///
/// Sorting peers fastest-first therefore tries unknown peers before any
/// measured one.
pub const INITIAL_SPEED: u64 = u64::MAX;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Connection open, handshake pending.
    Connected,
    /// Handshake completed. Only these peers receive work.
    Handshaked,
    /// Connection closed.
    Disconnected,
}

/// Working state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerWorkingState {
    /// Ready for a new block.
    Idle,
    /// Sending a block.
    Processing,
    /// Failed mid-transfer. Never given work again.
    Discarded,
}

/// Progress of one download attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Block being downloaded.
    pub block_hash: BlockHash,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Peer sending the block.
    pub peer: PeerAddress,
    /// The peer stream went corrupt during the transfer.
    pub corrupted: bool,
    /// Size of the block message, once the body started arriving.
    pub total_bytes: Option<u64>,
    /// Bytes received so far.
    pub bytes_downloaded: u64,
    /// When the block was requested.
    pub started_at: Timestamp,
    /// When the byte counter last changed.
    pub last_bytes_at: Timestamp,
}

impl DownloadProgress {
    /// Progress of a block just requested at `now`.
    pub fn new(block_hash: BlockHash, attempt: u32, peer: PeerAddress, now: Timestamp) -> Self {
        Self {
            block_hash,
            attempt,
            peer,
            corrupted: false,
            total_bytes: None,
            bytes_downloaded: 0,
            started_at: now,
            last_bytes_at: now,
        }
    }

    /// Time since the last byte was received.
    pub fn idle_for(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.last_bytes_at)
    }

    /// Time since the block was requested.
    pub fn elapsed(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.started_at)
    }

    /// Bytes this transfer accounts for in the bandwidth budget.
    pub fn bytes_in_flight(&self) -> u64 {
        self.total_bytes.unwrap_or(self.bytes_downloaded)
    }
}

/// State kept for one peer address.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    address: PeerAddress,
    connection_state: PeerConnectionState,
    working_state: PeerWorkingState,
    speed: u64,
    progress: Option<DownloadProgress>,
}

impl PeerRecord {
    /// A freshly connected, idle peer with no speed history.
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            connection_state: PeerConnectionState::Connected,
            working_state: PeerWorkingState::Idle,
            speed: INITIAL_SPEED,
            progress: None,
        }
    }

    /// Address of the peer.
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Connection state.
    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    /// Working state.
    pub fn working_state(&self) -> PeerWorkingState {
        self.working_state
    }

    /// Smoothed speed in bytes/sec ([`INITIAL_SPEED`] if never measured).
    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// Progress of the current transfer.
    pub fn progress(&self) -> Option<&DownloadProgress> {
        self.progress.as_ref()
    }

    /// Block the peer is sending, if any.
    pub fn downloading_block(&self) -> Option<BlockHash> {
        self.progress.as_ref().map(|p| p.block_hash)
    }

    /// Handshaked and still connected.
    pub fn is_handshaked(&self) -> bool {
        self.connection_state == PeerConnectionState::Handshaked
    }

    /// Currently sending a block.
    pub fn is_processing(&self) -> bool {
        self.working_state == PeerWorkingState::Processing
    }

    /// Handshaked and ready for work.
    pub fn is_available(&self) -> bool {
        self.is_handshaked() && self.working_state == PeerWorkingState::Idle
    }

    /// Reuse this record for a new connection from the same address.
    ///
    /// Speed history survives, everything else starts over.
    pub fn reconnect(&mut self) {
        self.connection_state = PeerConnectionState::Connected;
        self.working_state = PeerWorkingState::Idle;
        self.progress = None;
    }

    /// Mark the handshake as completed.
    pub fn handshake(&mut self) {
        self.connection_state = PeerConnectionState::Handshaked;
    }

    /// Mark the connection as closed. Progress is kept until released.
    pub fn disconnect(&mut self) {
        self.connection_state = PeerConnectionState::Disconnected;
    }

    /// Start sending `block_hash`.
    pub fn start_processing(&mut self, block_hash: BlockHash, attempt: u32, now: Timestamp) {
        self.working_state = PeerWorkingState::Processing;
        self.progress = Some(DownloadProgress::new(block_hash, attempt, self.address, now));
    }

    /// Back to idle, returning the progress of the transfer that ended.
    pub fn release(&mut self) -> Option<DownloadProgress> {
        if self.working_state != PeerWorkingState::Discarded {
            self.working_state = PeerWorkingState::Idle;
        }
        self.progress.take()
    }

    /// Stop giving work to this peer.
    pub fn discard(&mut self) -> Option<DownloadProgress> {
        self.working_state = PeerWorkingState::Discarded;
        self.progress.take()
    }

    /// Refresh the transfer progress from a stream snapshot.
    ///
    /// Only block messages count. The total size is latched once the body
    /// starts arriving; a corrupted stream freezes the progress. Returns
    /// `true` when new bytes were seen.
    pub fn update_progress(&mut self, snapshot: &StreamSnapshot, now: Timestamp) -> bool {
        let Some(progress) = self.progress.as_mut() else {
            return false;
        };
        if progress.corrupted {
            return false;
        }
        if snapshot.state == StreamState::Corrupted {
            progress.corrupted = true;
            return false;
        }
        let Some(message) = snapshot.current_message.as_ref().filter(|m| m.is_block()) else {
            return false;
        };

        if progress.total_bytes.is_none() && snapshot.state == StreamState::DeserializingBody {
            progress.total_bytes = Some(message.length);
        }
        if snapshot.bytes_received != progress.bytes_downloaded {
            progress.bytes_downloaded = snapshot.bytes_received;
            progress.last_bytes_at = now;
            return true;
        }
        false
    }

    /// Fold a completed transfer into the smoothed speed.
    pub fn record_speed(&mut self, bytes: u64, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
        let sample = bytes.saturating_mul(1_000) / millis;
        self.speed = if self.speed == INITIAL_SPEED {
            sample
        } else {
            self.speed / 2 + sample / 2
        };
    }

    /// Serializable view for state snapshots.
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            address: self.address,
            connection_state: self.connection_state,
            working_state: self.working_state,
            speed: (self.speed != INITIAL_SPEED).then_some(self.speed),
            progress: self.progress.clone(),
        }
    }
}

/// Serializable view of a [`PeerRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    /// Peer address.
    pub address: PeerAddress,
    /// Connection state.
    pub connection_state: PeerConnectionState,
    /// Working state.
    pub working_state: PeerWorkingState,
    /// Smoothed speed in bytes/sec, `None` until the first block completes.
    pub speed: Option<u64>,
    /// Current transfer.
    pub progress: Option<DownloadProgress>,
}
