//! # Error Types
//!
//! Parsing errors for the shared entities.

use thiserror::Error;

/// Errors raised while building an entity from external input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    /// The block hash string is not valid hex.
    #[error("Invalid block hash hex: {0}")]
    InvalidHex(String),

    /// The block hash has the wrong number of bytes.
    #[error("Invalid block hash length: {got} bytes, expected 32")]
    InvalidHashLength { got: usize },

    /// The peer address could not be parsed.
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
}
