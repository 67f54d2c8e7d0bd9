//! # Network Events
//!
//! Defines all event types that flow through the shared bus: peer lifecycle
//! notifications from the connection layer, block deliveries from the wire
//! layer, and the requests/outcomes produced by the block downloader.

use serde::{Deserialize, Serialize};
use shared_types::entities::{BlockHash, BlockHeader, PeerAddress};

/// Who produced a block-delivery notification.
///
/// The downloader republishes lite blocks as a header + chunk pair so every
/// consumer sees one delivery contract. Those republished notifications are
/// tagged [`EventOrigin::Downloader`] and must not be processed again by the
/// downloader itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventOrigin {
    /// Decoded from bytes received on a peer connection.
    #[default]
    Wire,
    /// Synthesized by the block downloader.
    Downloader,
}

/// All events that can be published to the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkEvent {
    // =========================================================================
    // SESSION
    // =========================================================================
    /// The network session started.
    NetStarted,

    /// The network session is stopping. Consumers release per-session state.
    NetStopped,

    /// The number of handshaked peers reached the configured minimum.
    MinHandshakedPeersReached {
        /// Handshaked peers at the time of the notification.
        peers: usize,
    },

    /// The number of handshaked peers dropped below the configured minimum.
    MinHandshakedPeersLost {
        /// Handshaked peers at the time of the notification.
        peers: usize,
    },

    // =========================================================================
    // PEER LIFECYCLE
    // =========================================================================
    /// A connection to a peer is open and ready to carry messages.
    PeerConnected {
        /// The peer.
        peer: PeerAddress,
    },

    /// The protocol handshake with a peer completed.
    PeerHandshaked {
        /// The peer.
        peer: PeerAddress,
    },

    /// A peer connection was closed.
    PeerDisconnected {
        /// The peer.
        peer: PeerAddress,
        /// Human readable reason.
        reason: String,
    },

    // =========================================================================
    // WIRE DELIVERIES
    // =========================================================================
    /// A peer advertised blocks it can serve.
    BlockAnnounced {
        /// The announcing peer.
        peer: PeerAddress,
        /// Announced blocks.
        hashes: Vec<BlockHash>,
    },

    /// A peer answered a block request with "not found".
    BlockNotFound {
        /// The peer.
        peer: PeerAddress,
        /// Items listed in the not-found payload.
        hashes: Vec<BlockHash>,
    },

    /// The header of a block has been received.
    BlockHeaderDownloaded {
        /// The sending peer.
        peer: PeerAddress,
        /// The header.
        header: BlockHeader,
        /// Size of the whole block message in bytes.
        block_size: u64,
        /// Producer of this notification.
        origin: EventOrigin,
    },

    /// A chunk of transactions of a block has been received.
    BlockTxsDownloaded {
        /// The sending peer.
        peer: PeerAddress,
        /// Block the transactions belong to.
        block_hash: BlockHash,
        /// Number of transactions in this chunk.
        txs_count: u64,
        /// Producer of this notification.
        origin: EventOrigin,
    },

    /// A small block was received and deserialized as a single unit.
    LiteBlockDownloaded {
        /// The sending peer.
        peer: PeerAddress,
        /// Header of the block.
        header: BlockHeader,
        /// Size of the block message in bytes.
        block_size: u64,
    },

    /// A block was received as raw bytes, without deserializing its body.
    RawBlockDownloaded {
        /// The sending peer.
        peer: PeerAddress,
        /// Header of the block.
        header: BlockHeader,
        /// Size of the block message in bytes.
        block_size: u64,
    },

    // =========================================================================
    // BLOCK DOWNLOADER REQUESTS
    // =========================================================================
    /// The downloader asks the wire layer to request a block from a peer.
    GetBlockRequested {
        /// The peer to ask.
        peer: PeerAddress,
        /// The block to fetch.
        block_hash: BlockHash,
    },

    /// The downloader turns the keep-alive probe of a peer on or off.
    KeepAliveChanged {
        /// The peer.
        peer: PeerAddress,
        /// `false` while the peer is busy sending a block.
        enabled: bool,
    },

    // =========================================================================
    // BLOCK DOWNLOADER OUTCOMES
    // =========================================================================
    /// A block was fully downloaded.
    BlockDownloaded {
        /// The peer that delivered it.
        peer: PeerAddress,
        /// Header of the block.
        header: BlockHeader,
        /// Size in bytes.
        block_size: u64,
        /// Time from request to completion, zero if the block was not requested.
        duration_ms: u64,
    },

    /// A block exhausted its download attempts and was discarded.
    BlockDiscarded {
        /// The block.
        block_hash: BlockHash,
        /// Why it was discarded.
        reason: String,
    },
}

impl NetworkEvent {
    /// Get the topic for this event (for filtering).
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::NetStarted
            | Self::NetStopped
            | Self::MinHandshakedPeersReached { .. }
            | Self::MinHandshakedPeersLost { .. } => EventTopic::Session,
            Self::PeerConnected { .. }
            | Self::PeerHandshaked { .. }
            | Self::PeerDisconnected { .. } => EventTopic::Peers,
            Self::BlockAnnounced { .. } | Self::BlockNotFound { .. } => EventTopic::Inventory,
            Self::BlockHeaderDownloaded { .. }
            | Self::BlockTxsDownloaded { .. }
            | Self::LiteBlockDownloaded { .. }
            | Self::RawBlockDownloaded { .. } => EventTopic::BlockDelivery,
            Self::GetBlockRequested { .. } | Self::KeepAliveChanged { .. } => {
                EventTopic::Requests
            }
            Self::BlockDownloaded { .. } | Self::BlockDiscarded { .. } => EventTopic::Download,
        }
    }

    /// Get the peer this event is scoped to, if any.
    #[must_use]
    pub fn peer(&self) -> Option<PeerAddress> {
        match self {
            Self::PeerConnected { peer }
            | Self::PeerHandshaked { peer }
            | Self::PeerDisconnected { peer, .. }
            | Self::BlockAnnounced { peer, .. }
            | Self::BlockNotFound { peer, .. }
            | Self::BlockHeaderDownloaded { peer, .. }
            | Self::BlockTxsDownloaded { peer, .. }
            | Self::LiteBlockDownloaded { peer, .. }
            | Self::RawBlockDownloaded { peer, .. }
            | Self::GetBlockRequested { peer, .. }
            | Self::KeepAliveChanged { peer, .. }
            | Self::BlockDownloaded { peer, .. } => Some(*peer),
            Self::NetStarted
            | Self::NetStopped
            | Self::MinHandshakedPeersReached { .. }
            | Self::MinHandshakedPeersLost { .. }
            | Self::BlockDiscarded { .. } => None,
        }
    }
}

/// Event topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Session start/stop and peer-count thresholds.
    Session,
    /// Peer connect/handshake/disconnect.
    Peers,
    /// Block announcements and not-found answers.
    Inventory,
    /// Block header, chunk and whole-block deliveries.
    BlockDelivery,
    /// Outbound requests issued by the downloader.
    Requests,
    /// Download outcomes (downloaded/discarded).
    Download,
    /// All events (no filtering).
    All,
}

/// Filter for subscribing to specific events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<EventTopic>,
}

impl EventFilter {
    /// Create a filter that accepts all events.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for specific topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self { topics }
    }

    /// Check if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &NetworkEvent) -> bool {
        self.topics.is_empty()
            || self.topics.contains(&EventTopic::All)
            || self.topics.contains(&event.topic())
    }
}
