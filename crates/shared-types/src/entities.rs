//! # Core Domain Entities
//!
//! ## Contents
//!
//! - [`BlockHash`]: 32-byte block identifier, the canonical key of every
//!   per-block table in the download subsystem
//! - [`PeerAddress`]: network address identifying a remote peer
//! - [`BlockHeader`]: header metadata announced ahead of a block body
//! - [`Timestamp`]: millisecond wall-clock instant

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::EntityError;

/// A 32-byte hash (e.g., SHA-256d of a block header).
pub type Hash = [u8; 32];

// =============================================================================
// BLOCK IDENTIFIER
// =============================================================================

/// Block identifier.
///
/// Compares and hashes on the raw bytes. Displays (and serializes) as
/// lowercase hex so it can be used directly in logs and JSON snapshots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub Hash);

impl BlockHash {
    /// Create a block hash from raw bytes.
    pub fn new(bytes: Hash) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a block hash from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, EntityError> {
        let bytes = hex::decode(s).map_err(|e| EntityError::InvalidHex(e.to_string()))?;
        let hash: Hash = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EntityError::InvalidHashLength { got: bytes.len() })?;
        Ok(Self(hash))
    }
}

impl From<Hash> for BlockHash {
    fn from(bytes: Hash) -> Self {
        Self(bytes)
    }
}

impl FromStr for BlockHash {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// PEER ADDRESS
// =============================================================================

/// Network address of a remote peer. This is the peer's identity key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    /// Create a peer address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Get the underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for PeerAddress {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| EntityError::InvalidPeerAddress(s.to_string()))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

// =============================================================================
// BLOCK HEADER
// =============================================================================

/// Header metadata of a downloaded block.
///
/// For big blocks this arrives first and declares how many transactions the
/// following chunk notifications will carry in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockHeader {
    /// Hash of this block.
    pub hash: BlockHash,
    /// Hash of the parent block.
    pub prev_block_hash: BlockHash,
    /// Unix timestamp (seconds) carried in the header.
    pub time: u64,
    /// Number of transactions declared for the block body.
    pub transaction_count: u64,
}

impl BlockHeader {
    /// Create a header.
    pub fn new(hash: BlockHash, prev_block_hash: BlockHash, transaction_count: u64) -> Self {
        Self {
            hash,
            prev_block_hash,
            time: 0,
            transaction_count,
        }
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Wall-clock instant in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds since the epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Current system time. Falls back to the epoch if the clock is before it.
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self` (zero if `earlier` is later).
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Add a duration (saturating).
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_hex_round_trip() {
        let hash = BlockHash::new([0xAB; 32]);
        let parsed: BlockHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn test_block_hash_rejects_short_input() {
        let err = BlockHash::from_hex("abcd").unwrap_err();
        assert_eq!(err, EntityError::InvalidHashLength { got: 2 });
    }

    #[test]
    fn test_block_hash_rejects_bad_hex() {
        assert!(matches!(
            BlockHash::from_hex("zz"),
            Err(EntityError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_block_hash_serializes_as_hex_string() {
        let hash = BlockHash::new([1u8; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: BlockHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_peer_address_parse() {
        let peer: PeerAddress = "127.0.0.1:8333".parse().unwrap();
        assert_eq!(peer.socket_addr().port(), 8333);
        assert!("not-an-address".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t0 = Timestamp::from_millis(1_000);
        let t1 = t0.saturating_add(Duration::from_millis(500));
        assert_eq!(t1.as_millis(), 1_500);
        assert_eq!(t1.saturating_since(t0), Duration::from_millis(500));
        assert_eq!(t0.saturating_since(t1), Duration::ZERO);
    }
}
