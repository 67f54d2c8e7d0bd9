//! # Pending Queue
//!
//! Ordered backlog of blocks waiting for a peer, with the per-block metadata
//! the assignment policy needs: announcers, exclusivity, priority peers,
//! recent failures and attempt counters.
//!
//! ## Invariants
//!
//! - A block appears in the backlog at most once.
//! - A block has an attempt counter iff it is being attempted (assigned,
//!   queued again for a retry, or in limbo).

use std::collections::{HashMap, HashSet, VecDeque};

use shared_types::entities::{BlockHash, PeerAddress, Timestamp};

use super::policy::{AssignmentPolicy, BlockContext, PeerPool, RejectionReason, Verdict};

/// Result of scanning the backlog for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The block was assigned and removed from the backlog.
    Assigned(BlockHash),
    /// Nothing matched. One entry per block considered.
    Rejected(Vec<(BlockHash, RejectionReason)>),
}

/// Blocks waiting to be downloaded.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<BlockHash>,
    members: HashSet<BlockHash>,
    announcers: HashMap<BlockHash, HashSet<PeerAddress>>,
    exclusivity: HashMap<BlockHash, PeerAddress>,
    priority_peers: HashMap<BlockHash, HashSet<PeerAddress>>,
    failures: HashMap<BlockHash, HashMap<PeerAddress, Timestamp>>,
    attempts: HashMap<BlockHash, u32>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add blocks to the backlog.
    ///
    /// Priority blocks go to the front, keeping their relative order. Blocks
    /// already queued are left where they are.
    pub fn add(&mut self, hashes: &[BlockHash], priority: bool) {
        if priority {
            for hash in hashes.iter().rev() {
                if self.members.insert(*hash) {
                    self.queue.push_front(*hash);
                }
            }
        } else {
            for hash in hashes {
                if self.members.insert(*hash) {
                    self.queue.push_back(*hash);
                }
            }
        }
    }

    /// Remove a block from the backlog. Metadata is kept.
    pub fn remove(&mut self, hash: &BlockHash) -> bool {
        if !self.members.remove(hash) {
            return false;
        }
        self.queue.retain(|h| h != hash);
        true
    }

    /// Record that `peer` announced `hash`.
    pub fn register_announcement(&mut self, hash: BlockHash, peer: PeerAddress) {
        self.announcers.entry(hash).or_default().insert(peer);
    }

    /// Reserve blocks to a single peer.
    pub fn register_exclusivity(&mut self, hashes: &[BlockHash], peer: PeerAddress) {
        for hash in hashes {
            self.exclusivity.insert(*hash, peer);
        }
    }

    /// Prefer `peer` for blocks.
    pub fn register_priority(&mut self, hashes: &[BlockHash], peer: PeerAddress) {
        for hash in hashes {
            self.priority_peers.entry(*hash).or_default().insert(peer);
        }
    }

    /// Record that `peer` failed to deliver `hash` at `now`.
    pub fn register_failure(&mut self, hash: BlockHash, peer: PeerAddress, now: Timestamp) {
        self.failures.entry(hash).or_default().insert(peer, now);
    }

    /// Start a new attempt on `hash`, returning its 1-based number.
    pub fn register_new_attempt(&mut self, hash: BlockHash) -> u32 {
        let attempts = self.attempts.entry(hash).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// The block was downloaded: drop it and everything known about it.
    pub fn register_downloaded(&mut self, hash: &BlockHash) {
        self.forget(hash);
    }

    /// The block was discarded: drop it, its attempts and its failures.
    ///
    /// Announcements and peer preferences survive for the later retry.
    pub fn register_discarded(&mut self, hash: &BlockHash) {
        self.remove(hash);
        self.attempts.remove(hash);
        self.failures.remove(hash);
    }

    /// The block was cancelled: drop it and everything known about it.
    pub fn register_cancelled(&mut self, hash: &BlockHash) {
        self.forget(hash);
    }

    fn forget(&mut self, hash: &BlockHash) {
        self.remove(hash);
        self.announcers.remove(hash);
        self.exclusivity.remove(hash);
        self.priority_peers.remove(hash);
        self.failures.remove(hash);
        self.attempts.remove(hash);
    }

    /// Copy of the backlog, in order.
    pub fn snapshot(&self) -> Vec<BlockHash> {
        self.queue.iter().copied().collect()
    }

    /// Attempts made on `hash` so far (0 if not being attempted).
    pub fn attempts(&self, hash: &BlockHash) -> u32 {
        self.attempts.get(hash).copied().unwrap_or(0)
    }

    /// Whether `hash` holds an attempt counter.
    pub fn is_being_attempted(&self, hash: &BlockHash) -> bool {
        self.attempts.contains_key(hash)
    }

    /// Whether any block holds an attempt counter.
    pub fn has_attempts(&self) -> bool {
        !self.attempts.is_empty()
    }

    /// Whether `hash` is in the backlog.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.members.contains(hash)
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Find the first block `peer` may download and take it out of the backlog.
    ///
    /// In `restricted` mode blocks that are not mid-attempt are skipped.
    pub fn extract_best_match(
        &mut self,
        peer: PeerAddress,
        pool: &PeerPool<'_>,
        policy: &AssignmentPolicy,
        restricted: bool,
        now: Timestamp,
    ) -> MatchOutcome {
        let mut rejections = Vec::new();
        let mut matched = None;

        for (index, hash) in self.queue.iter().enumerate() {
            if restricted && !self.attempts.contains_key(hash) {
                continue;
            }
            let context = BlockContext {
                announcers: self.announcers.get(hash),
                exclusive_peer: self.exclusivity.get(hash).copied(),
                priority_peers: self.priority_peers.get(hash),
                last_failure: self.failures.get(hash).and_then(|f| f.get(&peer)).copied(),
            };
            match policy.evaluate(peer, &context, pool, restricted, now) {
                Verdict::Assigned => {
                    matched = Some(index);
                    break;
                }
                Verdict::Rejected(reason) => rejections.push((*hash, reason)),
            }
        }

        match matched.and_then(|index| self.queue.remove(index)) {
            Some(hash) => {
                self.members.remove(&hash);
                MatchOutcome::Assigned(hash)
            }
            None => MatchOutcome::Rejected(rejections),
        }
    }
}
