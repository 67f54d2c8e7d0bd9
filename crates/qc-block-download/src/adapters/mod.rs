//! # Adapters
//!
//! Concrete implementations of the outbound ports.

pub mod streams;
pub mod time;

pub use streams::InMemoryPeerStreams;
pub use time::{ManualTimeSource, SystemTimeSource};
