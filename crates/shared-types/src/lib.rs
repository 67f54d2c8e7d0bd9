//! # Shared Types Crate
//!
//! Entities exchanged between the event bus, the block-download subsystem and
//! the node runtime.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: identifiers used on the bus are defined here.
//! - **Canonical keys**: block identifiers compare and hash by their raw bytes
//!   and display as lowercase hex.

pub mod entities;
pub mod errors;

pub use entities::*;
pub use errors::*;
