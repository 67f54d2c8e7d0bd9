//! # Domain Module
//!
//! Core types of the block downloader: peer records, the pending queue, the
//! assignment policy and the history log.

pub mod entities;
pub mod errors;
pub mod history;
pub mod peer;
pub mod pending;
pub mod policy;

pub use entities::*;
pub use errors::*;
pub use history::*;
pub use peer::*;
pub use pending::*;
pub use policy::*;
