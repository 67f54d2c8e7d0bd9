//! # Application Layer
//!
//! The coordinator state machine and the service task that drives it.

pub mod coordinator;
pub mod service;

pub use coordinator::DownloadCoordinator;
pub use service::{DownloadHandle, DownloadService, COMMAND_CHANNEL_CAPACITY};
