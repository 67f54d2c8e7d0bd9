//! # Download History
//!
//! Append-only diagnostic log per block. Entries expire after the configured
//! retention and are purged periodically by the coordinator.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use shared_types::entities::{BlockHash, PeerAddress, Timestamp};

/// One history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryItem {
    /// When it happened.
    pub timestamp: Timestamp,
    /// Peer involved, if any.
    pub peer: Option<PeerAddress>,
    /// What happened.
    pub message: String,
}

/// Per-block history log.
#[derive(Debug, Default)]
pub struct DownloadHistory {
    enabled: bool,
    retention: Duration,
    items: HashMap<BlockHash, Vec<HistoryItem>>,
}

impl DownloadHistory {
    /// Create a history log.
    pub fn new(enabled: bool, retention: Duration) -> Self {
        Self {
            enabled,
            retention,
            items: HashMap::new(),
        }
    }

    /// Append an entry for `hash`. No-op when disabled.
    pub fn register(
        &mut self,
        hash: BlockHash,
        peer: Option<PeerAddress>,
        message: impl Into<String>,
        now: Timestamp,
    ) {
        if !self.enabled {
            return;
        }
        self.items.entry(hash).or_default().push(HistoryItem {
            timestamp: now,
            peer,
            message: message.into(),
        });
    }

    /// Drop entries older than the retention period.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let retention = self.retention;
        let mut removed = 0;
        self.items.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|item| now.saturating_since(item.timestamp) <= retention);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Entries recorded for `hash`, oldest first.
    pub fn history_for(&self, hash: &BlockHash) -> Vec<HistoryItem> {
        self.items.get(hash).cloned().unwrap_or_default()
    }

    /// Forget everything about `hash`.
    pub fn clear_block(&mut self, hash: &BlockHash) {
        self.items.remove(hash);
    }

    /// Number of blocks with at least one entry.
    pub fn block_count(&self) -> usize {
        self.items.len()
    }
}
