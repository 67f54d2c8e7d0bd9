//! # QC Block Download
//!
//! Decides which connected peer downloads which block, tracks transfers in
//! flight, and recovers from stalled or failed downloads.
//!
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Responsibilities
//!
//! - Assign pending blocks to idle handshaked peers, fastest peers first
//! - Watch busy peers for corruption, stalls and timeouts
//! - Retry failed blocks, discard them after too many attempts and retry
//!   discarded blocks after a cooldown
//! - Cap concurrent downloads and bytes in flight
//! - Honor exclusivity, preferred peers and announcers
//!
//! ## Guarantees
//!
//! | Property | Description |
//! |----------|-------------|
//! | At most one assignment | A block is held by at most one peer at a time |
//! | Conservation | A requested block ends downloaded, discarded or cancelled |
//! | Monotonic attempts | The attempt counter of a block only grows until it resolves |
//! | Idempotent cancel | Cancelling twice has the effect of cancelling once |
//!
//! ## Module Structure
//!
//! ```text
//! qc-block-download/
//! ├── domain/          # PeerRecord, PendingQueue, AssignmentPolicy, history, errors
//! ├── application/     # DownloadCoordinator + DownloadService task
//! ├── ports/           # BlockDownloadApi (inbound), PeerStreams/TimeSource (outbound)
//! ├── adapters/        # In-memory streams, system and manual clocks
//! └── config.rs        # DownloadConfig
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use application::{DownloadCoordinator, DownloadHandle, DownloadService};
pub use config::{AnnouncersPolicy, DownloadConfig, DownloadCriteria, FallbackAction, HistoryConfig};
pub use domain::{
    ConfigError, DownloadError, DownloadRequest, DownloadState, HandlerState, HistoryItem,
    PeerConnectionState, PeerSnapshot, PeerWorkingState, RejectionReason, StreamError,
};
pub use ports::{
    BlockDownloadApi, MessageHeader, PeerStreams, StreamSnapshot, StreamState, TimeSource,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
