//! # Domain Errors
//!
//! Error types for the block downloader.

use thiserror::Error;

use shared_types::entities::PeerAddress;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A limit or timeout that must be non-zero is zero.
    #[error("Configuration field `{field}` must be positive")]
    MustBePositive {
        /// Offending field
        field: &'static str,
    },

    /// Two settings contradict each other.
    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Errors reported by the peer stream port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// No stream is registered for this peer.
    #[error("No stream for peer {0}")]
    UnknownPeer(PeerAddress),

    /// The stream exists but refused the operation.
    #[error("Stream operation failed for peer {peer}: {reason}")]
    OperationFailed {
        /// Peer owning the stream
        peer: PeerAddress,
        /// Reason reported by the stream
        reason: String,
    },
}

/// Block downloader error types.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A stream operation failed.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// The download service is no longer running.
    #[error("Block download service stopped")]
    ServiceStopped,

    /// The service dropped a query before answering it.
    #[error("Block download service dropped the response")]
    ResponseDropped,
}
