//! # In-Memory Peer Streams
//!
//! [`PeerStreams`] adapter backed by a lock-protected map. The connection
//! layer (or a test) writes stream snapshots into it, the downloader reads
//! them on every tick.

use std::collections::HashMap;

use parking_lot::RwLock;
use shared_types::entities::PeerAddress;

use crate::domain::StreamError;
use crate::ports::{MessageHeader, PeerStreams, StreamSnapshot, StreamState, BLOCK_COMMAND};

/// Receive buffer size of an idle peer.
pub const IDLE_BUFFER_SIZE: usize = 64 * 1024;

/// Receive buffer size while a block is being transferred.
pub const BLOCK_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
struct StreamSlot {
    snapshot: StreamSnapshot,
    buffer_size: usize,
}

impl Default for StreamSlot {
    fn default() -> Self {
        Self {
            snapshot: StreamSnapshot::default(),
            buffer_size: IDLE_BUFFER_SIZE,
        }
    }
}

/// In-memory implementation of [`PeerStreams`].
#[derive(Debug, Default)]
pub struct InMemoryPeerStreams {
    slots: RwLock<HashMap<PeerAddress, StreamSlot>>,
}

impl InMemoryPeerStreams {
    /// Create an empty stream table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `peer` in its idle state.
    pub fn open(&self, peer: PeerAddress) {
        self.slots.write().entry(peer).or_default();
    }

    /// Drop the stream of `peer`.
    pub fn close(&self, peer: &PeerAddress) {
        self.slots.write().remove(peer);
    }

    /// Replace the snapshot of `peer`, opening its stream if needed.
    pub fn set_snapshot(&self, peer: PeerAddress, snapshot: StreamSnapshot) {
        self.slots.write().entry(peer).or_default().snapshot = snapshot;
    }

    /// Mark `peer` as receiving the body of a block of `length` bytes.
    pub fn begin_block(&self, peer: PeerAddress, length: u64) {
        self.set_snapshot(
            peer,
            StreamSnapshot {
                current_message: Some(MessageHeader::new(BLOCK_COMMAND, length)),
                bytes_received: 0,
                state: StreamState::DeserializingBody,
            },
        );
    }

    /// Set the byte counter of the current message of `peer`.
    pub fn set_bytes_received(&self, peer: &PeerAddress, bytes: u64) {
        if let Some(slot) = self.slots.write().get_mut(peer) {
            slot.snapshot.bytes_received = bytes;
        }
    }

    /// Flag the stream of `peer` as corrupted.
    pub fn corrupt(&self, peer: &PeerAddress) {
        if let Some(slot) = self.slots.write().get_mut(peer) {
            slot.snapshot.state = StreamState::Corrupted;
        }
    }

    /// Current receive buffer size of `peer`.
    pub fn buffer_size(&self, peer: &PeerAddress) -> Option<usize> {
        self.slots.read().get(peer).map(|slot| slot.buffer_size)
    }

    fn set_buffer_size(&self, peer: &PeerAddress, size: usize) -> Result<(), StreamError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(peer)
            .ok_or(StreamError::UnknownPeer(*peer))?;
        slot.buffer_size = size;
        Ok(())
    }
}

impl PeerStreams for InMemoryPeerStreams {
    fn snapshot(&self, peer: &PeerAddress) -> Option<StreamSnapshot> {
        self.slots.read().get(peer).map(|slot| slot.snapshot.clone())
    }

    fn upgrade_buffer(&self, peer: &PeerAddress) -> Result<(), StreamError> {
        self.set_buffer_size(peer, BLOCK_BUFFER_SIZE)
    }

    fn reset_buffer(&self, peer: &PeerAddress) -> Result<(), StreamError> {
        self.set_buffer_size(peer, IDLE_BUFFER_SIZE)?;
        if let Some(slot) = self.slots.write().get_mut(peer) {
            slot.snapshot = StreamSnapshot::default();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddress {
        "10.0.0.7:8333".parse().unwrap()
    }

    #[test]
    fn test_unknown_peer_has_no_snapshot() {
        let streams = InMemoryPeerStreams::new();
        assert!(streams.snapshot(&peer()).is_none());
        assert_eq!(
            streams.upgrade_buffer(&peer()),
            Err(StreamError::UnknownPeer(peer()))
        );
    }

    #[test]
    fn test_buffer_upgrade_and_reset() {
        let streams = InMemoryPeerStreams::new();
        streams.open(peer());
        assert_eq!(streams.buffer_size(&peer()), Some(IDLE_BUFFER_SIZE));

        streams.upgrade_buffer(&peer()).unwrap();
        assert_eq!(streams.buffer_size(&peer()), Some(BLOCK_BUFFER_SIZE));

        streams.begin_block(peer(), 500);
        streams.set_bytes_received(&peer(), 200);
        streams.reset_buffer(&peer()).unwrap();
        assert_eq!(streams.buffer_size(&peer()), Some(IDLE_BUFFER_SIZE));
        assert_eq!(streams.snapshot(&peer()), Some(StreamSnapshot::default()));
    }

    #[test]
    fn test_block_progress_snapshot() {
        let streams = InMemoryPeerStreams::new();
        streams.begin_block(peer(), 1_000);
        streams.set_bytes_received(&peer(), 250);

        let snapshot = streams.snapshot(&peer()).unwrap();
        assert!(snapshot.is_receiving_block());
        assert_eq!(snapshot.bytes_received, 250);

        streams.corrupt(&peer());
        assert_eq!(
            streams.snapshot(&peer()).unwrap().state,
            StreamState::Corrupted
        );

        streams.close(&peer());
        assert!(streams.snapshot(&peer()).is_none());
    }
}
