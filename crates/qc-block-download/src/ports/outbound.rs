//! # Outbound Ports
//!
//! Traits for the collaborators the downloader depends on: the per-peer
//! stream layer and the clock.

use serde::{Deserialize, Serialize};
use shared_types::entities::{PeerAddress, Timestamp};

use crate::domain::StreamError;

/// Wire command name of a block message.
pub const BLOCK_COMMAND: &str = "block";

/// Header of the message a peer stream is currently receiving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol command (e.g. `"block"`, `"inv"`).
    pub command: String,
    /// Declared payload length in bytes.
    pub length: u64,
}

impl MessageHeader {
    /// Create a message header.
    pub fn new(command: impl Into<String>, length: u64) -> Self {
        Self {
            command: command.into(),
            length,
        }
    }

    /// Whether the message carries a block.
    pub fn is_block(&self) -> bool {
        self.command == BLOCK_COMMAND
    }
}

/// Deserialization state of a peer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    /// Waiting for or reading a message header.
    #[default]
    SeekingBody,
    /// Reading the body of the current message.
    DeserializingBody,
    /// The stream received bytes it could not make sense of.
    Corrupted,
}

/// Point-in-time view of a peer stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSnapshot {
    /// Message currently being received, if any.
    pub current_message: Option<MessageHeader>,
    /// Bytes received so far for the current message.
    pub bytes_received: u64,
    /// Deserialization state.
    pub state: StreamState,
}

impl StreamSnapshot {
    /// Whether the stream is receiving the body of a block message.
    pub fn is_receiving_block(&self) -> bool {
        self.current_message
            .as_ref()
            .is_some_and(MessageHeader::is_block)
    }
}

/// Per-peer stream layer - outbound port.
///
/// Reads are synchronous snapshots so the coordinator can poll every busy
/// peer inside a single tick without awaiting.
pub trait PeerStreams: Send + Sync {
    /// Current state of the stream of `peer`, or `None` if it has no stream.
    fn snapshot(&self, peer: &PeerAddress) -> Option<StreamSnapshot>;

    /// Grow the receive buffer of `peer` ahead of a block transfer.
    fn upgrade_buffer(&self, peer: &PeerAddress) -> Result<(), StreamError>;

    /// Shrink the receive buffer of `peer` back to its idle size.
    fn reset_buffer(&self, peer: &PeerAddress) -> Result<(), StreamError>;
}

/// Abstract interface for time operations.
///
/// Allows deterministic testing of timeouts and cooldowns.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp.
    fn now(&self) -> Timestamp;
}
