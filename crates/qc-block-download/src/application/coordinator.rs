//! # Download Coordinator
//!
//! State machine deciding which peer downloads which block.
//!
//! Every method is synchronous and takes the current time, so the whole
//! coordinator can be driven deterministically from tests. Events meant for
//! the rest of the node are pushed into an outbox that the owner drains with
//! [`DownloadCoordinator::drain_events`] and publishes on the bus.
//!
//! ## Block lifecycle
//!
//! ```text
//! pending ──▶ assigned ──▶ downloaded
//!                │
//!                ▼
//!             in limbo ──▶ pending (retry, front of the queue)
//!                │
//!                ▼
//!            discarded ──▶ pending (after the discard cooldown)
//! ```
//!
//! `cancelled` can end the lifecycle at any point before `downloaded`. In
//! flight blocks are only marked `pending_to_cancel` and are cancelled when
//! their attempt resolves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shared_bus::{EventOrigin, NetworkEvent};
use shared_types::entities::{BlockHash, BlockHeader, PeerAddress, Timestamp};
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::domain::{
    AssignmentPolicy, BlockRejection, ConfigError, DownloadHistory, DownloadRequest,
    DownloadState, HandlerState, HistoryItem, MatchOutcome, PeerConnectionState, PeerPool,
    PeerRecord, PeerRejections, PendingQueue, RejectionReason,
};
use crate::ports::PeerStreams;

/// Header of a big block whose transactions are still arriving.
#[derive(Debug, Clone)]
struct PartialBlock {
    header: BlockHeader,
    block_size: u64,
    txs_received: u64,
}

/// Why an attempt was moved to limbo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StallReason {
    Corrupted,
    IdleTimeout,
    DownloadTimeout,
    Disconnected,
}

impl StallReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Corrupted => "stream corrupted",
            Self::IdleTimeout => "idle timeout",
            Self::DownloadTimeout => "download timeout",
            Self::Disconnected => "peer disconnected",
        }
    }
}

/// Block download coordinator.
pub struct DownloadCoordinator {
    config: DownloadConfig,
    policy: AssignmentPolicy,
    streams: Arc<dyn PeerStreams>,
    peers: HashMap<PeerAddress, PeerRecord>,
    pending: PendingQueue,
    in_limbo: HashSet<BlockHash>,
    discarded: HashMap<BlockHash, Timestamp>,
    pending_to_cancel: HashSet<BlockHash>,
    cancelled: HashSet<BlockHash>,
    downloaded: HashSet<BlockHash>,
    block_last_activity: HashMap<BlockHash, Timestamp>,
    partial_blocks: HashMap<BlockHash, PartialBlock>,
    history: DownloadHistory,
    client_paused: bool,
    enough_peers: bool,
    total_reattempts: u64,
    busy_percentage: u32,
    bandwidth_restricted: bool,
    last_rejections: HashMap<PeerAddress, Vec<(BlockHash, RejectionReason)>>,
    ticks: u64,
    outbox: Vec<NetworkEvent>,
}

impl DownloadCoordinator {
    /// Create a coordinator.
    pub fn new(config: DownloadConfig, streams: Arc<dyn PeerStreams>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            policy: AssignmentPolicy::new(config.criteria, config.failure_cooldown()),
            history: DownloadHistory::new(config.history.enabled, config.history.retention()),
            config,
            streams,
            peers: HashMap::new(),
            pending: PendingQueue::new(),
            in_limbo: HashSet::new(),
            discarded: HashMap::new(),
            pending_to_cancel: HashSet::new(),
            cancelled: HashSet::new(),
            downloaded: HashSet::new(),
            block_last_activity: HashMap::new(),
            partial_blocks: HashMap::new(),
            client_paused: false,
            enough_peers: true,
            total_reattempts: 0,
            busy_percentage: 0,
            bandwidth_restricted: false,
            last_rejections: HashMap::new(),
            ticks: 0,
            outbox: Vec::new(),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Running only when the client did not pause and enough peers are up.
    pub fn handler_state(&self) -> HandlerState {
        if !self.client_paused && self.enough_peers {
            HandlerState::Running
        } else {
            HandlerState::Paused
        }
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.outbox)
    }

    // =========================================================================
    // CLIENT REQUESTS
    // =========================================================================

    /// Queue blocks for download.
    pub fn download(&mut self, request: DownloadRequest, now: Timestamp) {
        let mut accepted = Vec::with_capacity(request.hashes.len());
        let mut added = Vec::new();

        for hash in &request.hashes {
            if self.downloaded.contains(hash) {
                if !request.force_download {
                    debug!(block = %hash, "Block already downloaded, skipping");
                    continue;
                }
                self.downloaded.remove(hash);
            }
            self.cancelled.remove(hash);
            self.pending_to_cancel.remove(hash);
            self.discarded.remove(hash);
            accepted.push(*hash);

            if self.is_assigned(hash) || self.in_limbo.contains(hash) || self.pending.contains(hash)
            {
                continue;
            }
            added.push(*hash);
            self.history.register(*hash, None, "download requested", now);
        }

        if let Some(peer) = request.exclusive_to_peer {
            self.pending.register_exclusivity(&accepted, peer);
        }
        if let Some(peer) = request.preferred_peer {
            self.pending.register_priority(&accepted, peer);
        }
        self.pending.add(&added, request.priority);

        debug!(
            requested = request.hashes.len(),
            added = added.len(),
            priority = request.priority,
            "Blocks queued for download"
        );
    }

    /// Cancel blocks. In-flight blocks are cancelled when their attempt ends.
    pub fn cancel(&mut self, hashes: &[BlockHash], now: Timestamp) {
        for hash in hashes {
            if self.cancelled.contains(hash) || self.downloaded.contains(hash) {
                continue;
            }
            if self.is_assigned(hash) || self.in_limbo.contains(hash) {
                self.pending_to_cancel.insert(*hash);
                self.history.register(*hash, None, "cancel requested while in flight", now);
                continue;
            }
            self.mark_cancelled(*hash, now);
        }
    }

    /// Stop assigning new blocks.
    pub fn pause(&mut self) {
        if !self.client_paused {
            info!("Block download paused by client");
        }
        self.client_paused = true;
    }

    /// Resume assigning blocks.
    pub fn resume(&mut self) {
        if self.client_paused {
            info!("Block download resumed by client");
        }
        self.client_paused = false;
    }

    /// Snapshot of the coordinator. Resets the busy-percentage gauge.
    pub fn state(&mut self) -> DownloadState {
        let mut peers: Vec<_> = self.peers.values().map(PeerRecord::snapshot).collect();
        peers.sort_by_key(|p| p.address);

        let mut rejections: Vec<_> = self
            .last_rejections
            .iter()
            .map(|(peer, rejected)| PeerRejections {
                peer: *peer,
                rejections: rejected
                    .iter()
                    .map(|(block, reason)| BlockRejection {
                        block: *block,
                        reason: *reason,
                    })
                    .collect(),
            })
            .collect();
        rejections.sort_by_key(|r| r.peer);

        let state = DownloadState {
            handler_state: self.handler_state(),
            client_paused: self.client_paused,
            enough_peers: self.enough_peers,
            pending: self.pending.snapshot(),
            downloaded: sorted(self.downloaded.iter()),
            discarded: sorted(self.discarded.keys()),
            cancelled: sorted(self.cancelled.iter()),
            pending_to_cancel: sorted(self.pending_to_cancel.iter()),
            in_limbo: sorted(self.in_limbo.iter()),
            peers,
            total_reattempts: self.total_reattempts,
            busy_percentage: self.busy_percentage,
            bandwidth_restricted: self.bandwidth_restricted,
            bytes_in_flight: self.bytes_in_flight(),
            rejections,
        };
        self.busy_percentage = 0;
        state
    }

    /// History of one block.
    pub fn block_history(&self, hash: &BlockHash) -> Vec<HistoryItem> {
        self.history.history_for(hash)
    }

    /// Attempts made on a block so far.
    pub fn attempts(&self, hash: &BlockHash) -> u32 {
        self.pending.attempts(hash)
    }

    /// Record of a peer, if known.
    pub fn peer(&self, address: &PeerAddress) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    // =========================================================================
    // BUS EVENTS
    // =========================================================================

    /// Apply a network event.
    pub fn handle_event(&mut self, event: NetworkEvent, now: Timestamp) {
        match event {
            NetworkEvent::NetStarted => info!("Network started, block download ready"),
            NetworkEvent::NetStopped => self.stop(now),
            NetworkEvent::MinHandshakedPeersReached { peers } => {
                info!(peers, "Minimum handshaked peers reached");
                self.enough_peers = true;
            }
            NetworkEvent::MinHandshakedPeersLost { peers } => {
                info!(peers, "Minimum handshaked peers lost");
                self.enough_peers = false;
            }
            NetworkEvent::PeerConnected { peer } => self.on_peer_connected(peer),
            NetworkEvent::PeerHandshaked { peer } => self.on_peer_handshaked(peer),
            NetworkEvent::PeerDisconnected { peer, reason } => {
                self.on_peer_disconnected(peer, &reason, now)
            }
            NetworkEvent::BlockAnnounced { peer, hashes } => {
                for hash in hashes {
                    self.pending.register_announcement(hash, peer);
                }
            }
            NetworkEvent::BlockNotFound { peer, hashes } => {
                self.on_block_not_found(peer, &hashes, now)
            }
            NetworkEvent::BlockHeaderDownloaded {
                peer,
                header,
                block_size,
                origin,
            } => {
                if origin == EventOrigin::Wire {
                    self.on_block_header(peer, header, block_size, now);
                }
            }
            NetworkEvent::BlockTxsDownloaded {
                peer,
                block_hash,
                txs_count,
                origin,
            } => {
                if origin == EventOrigin::Wire {
                    self.on_block_txs(peer, block_hash, txs_count, now);
                }
            }
            NetworkEvent::LiteBlockDownloaded {
                peer,
                header,
                block_size,
            } => self.on_lite_block(peer, header, block_size, now),
            NetworkEvent::RawBlockDownloaded {
                peer,
                header,
                block_size,
            } => self.process_success(peer, header, block_size, now),
            NetworkEvent::GetBlockRequested { .. }
            | NetworkEvent::KeepAliveChanged { .. }
            | NetworkEvent::BlockDownloaded { .. }
            | NetworkEvent::BlockDiscarded { .. } => {}
        }
    }

    fn on_peer_connected(&mut self, peer: PeerAddress) {
        match self.peers.get_mut(&peer) {
            Some(record) if record.is_processing() => {
                debug!(peer = %peer, "Stale connect event for busy peer, ignoring");
            }
            Some(record) if record.connection_state() == PeerConnectionState::Disconnected => {
                record.reconnect();
            }
            Some(_) => {
                debug!(peer = %peer, "Duplicate connect event for live peer, ignoring");
            }
            None => {
                self.peers.insert(peer, PeerRecord::new(peer));
            }
        }
    }

    fn on_peer_handshaked(&mut self, peer: PeerAddress) {
        let record = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::new(peer));
        if record.is_processing() {
            debug!(peer = %peer, "Stale handshake event for busy peer, ignoring");
            return;
        }
        record.handshake();
        debug!(peer = %peer, "Peer available for block download");
    }

    fn on_peer_disconnected(&mut self, peer: PeerAddress, reason: &str, now: Timestamp) {
        let Some(record) = self.peers.get_mut(&peer) else {
            return;
        };
        record.disconnect();
        let progress = record.release();
        self.last_rejections.remove(&peer);

        if let Some(progress) = progress {
            let block = progress.block_hash;
            debug!(peer = %peer, block = %block, reason, "Peer disconnected mid-download");
            if self.in_limbo.contains(&block) {
                self.pending.register_failure(block, peer, now);
            } else {
                self.move_to_limbo(peer, block, StallReason::Disconnected, now);
            }
        }
    }

    fn on_block_not_found(&mut self, peer: PeerAddress, hashes: &[BlockHash], now: Timestamp) {
        let [hash] = hashes else {
            debug!(peer = %peer, items = hashes.len(), "Ignoring not-found with multiple items");
            return;
        };
        let downloading = self.peers.get(&peer).and_then(PeerRecord::downloading_block);
        if downloading != Some(*hash) {
            return;
        }
        info!(peer = %peer, block = %hash, "Peer does not have the requested block");
        self.history.register(*hash, Some(peer), "peer answered not found", now);
        self.process_failure(*hash, now);
    }

    fn on_block_header(
        &mut self,
        peer: PeerAddress,
        header: BlockHeader,
        block_size: u64,
        now: Timestamp,
    ) {
        let hash = header.hash;
        self.touch(hash, now);
        if header.transaction_count == 0 {
            self.process_success(peer, header, block_size, now);
            return;
        }
        self.partial_blocks.insert(
            hash,
            PartialBlock {
                header,
                block_size,
                txs_received: 0,
            },
        );
    }

    fn on_block_txs(&mut self, peer: PeerAddress, hash: BlockHash, txs_count: u64, now: Timestamp) {
        let Some(partial) = self.partial_blocks.get_mut(&hash) else {
            debug!(peer = %peer, block = %hash, "Transactions for unknown block header, ignoring");
            return;
        };
        partial.txs_received = partial.txs_received.saturating_add(txs_count);
        let complete = partial.txs_received >= partial.header.transaction_count;
        self.touch(hash, now);

        if complete {
            if let Some(partial) = self.partial_blocks.remove(&hash) {
                self.process_success(peer, partial.header, partial.block_size, now);
            }
        }
    }

    fn on_lite_block(
        &mut self,
        peer: PeerAddress,
        header: BlockHeader,
        block_size: u64,
        now: Timestamp,
    ) {
        if self.cancelled.contains(&header.hash) || self.downloaded.contains(&header.hash) {
            self.process_success(peer, header, block_size, now);
            return;
        }
        self.outbox.push(NetworkEvent::BlockHeaderDownloaded {
            peer,
            header: header.clone(),
            block_size,
            origin: EventOrigin::Downloader,
        });
        self.outbox.push(NetworkEvent::BlockTxsDownloaded {
            peer,
            block_hash: header.hash,
            txs_count: header.transaction_count,
            origin: EventOrigin::Downloader,
        });
        self.process_success(peer, header, block_size, now);
    }

    fn touch(&mut self, hash: BlockHash, now: Timestamp) {
        if let Some(last) = self.block_last_activity.get_mut(&hash) {
            *last = now;
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Run one coordination round.
    pub fn tick(&mut self, now: Timestamp) {
        self.ticks = self.ticks.wrapping_add(1);

        self.scan_peers(now);
        self.reconcile_limbo(now);
        self.retry_discarded(now);
        self.update_busy_gauge();

        if self.ticks % self.config.history.cleanup_every_ticks == 0 {
            let purged = self.history.purge_expired(now);
            if purged > 0 {
                debug!(purged, "Expired download history purged");
            }
        }
    }

    fn scan_peers(&mut self, now: Timestamp) {
        let mut order: Vec<(u64, PeerAddress)> = self
            .peers
            .values()
            .map(|record| (record.speed(), record.address()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut available: HashSet<PeerAddress> = HashSet::new();
        let mut busy: HashSet<PeerAddress> = HashSet::new();
        for record in self.peers.values().filter(|r| r.is_handshaked()) {
            if record.is_processing() {
                busy.insert(record.address());
            } else if record.is_available() {
                available.insert(record.address());
            }
        }

        self.refresh_admission();
        for (_, address) in order {
            let Some(record) = self.peers.get(&address) else {
                continue;
            };
            if record.is_available() {
                if self.try_assign(address, &available, &busy, now) {
                    available.remove(&address);
                    busy.insert(address);
                }
            } else if record.is_processing() {
                self.check_progress(address, now);
            }
        }
    }

    /// Recompute the bandwidth flag. Returns whether another download may start.
    fn refresh_admission(&mut self) -> bool {
        let downloading = self.peers.values().filter(|r| r.is_processing()).count();
        self.bandwidth_restricted = self.bytes_in_flight() >= self.config.max_bytes_in_parallel();
        downloading == 0
            || (downloading < self.config.max_peers_downloading && !self.bandwidth_restricted)
    }

    fn try_assign(
        &mut self,
        peer: PeerAddress,
        available: &HashSet<PeerAddress>,
        busy: &HashSet<PeerAddress>,
        now: Timestamp,
    ) -> bool {
        let more_allowed = self.refresh_admission();
        let restricted = match self.handler_state() {
            HandlerState::Paused if self.pending.has_attempts() => true,
            HandlerState::Running if more_allowed => false,
            _ => return false,
        };

        let pool = PeerPool { available, busy };
        match self
            .pending
            .extract_best_match(peer, &pool, &self.policy, restricted, now)
        {
            MatchOutcome::Assigned(hash) => {
                self.assign(peer, hash, now);
                true
            }
            MatchOutcome::Rejected(rejections) => {
                if rejections.is_empty() {
                    self.last_rejections.remove(&peer);
                } else {
                    self.last_rejections.insert(peer, rejections);
                }
                false
            }
        }
    }

    fn assign(&mut self, peer: PeerAddress, hash: BlockHash, now: Timestamp) {
        let attempt = self.pending.register_new_attempt(hash);
        if let Some(record) = self.peers.get_mut(&peer) {
            record.start_processing(hash, attempt, now);
        }
        self.block_last_activity.insert(hash, now);
        self.last_rejections.remove(&peer);

        self.outbox.push(NetworkEvent::GetBlockRequested {
            peer,
            block_hash: hash,
        });
        self.outbox.push(NetworkEvent::KeepAliveChanged {
            peer,
            enabled: false,
        });
        if let Err(e) = self.streams.upgrade_buffer(&peer) {
            warn!(peer = %peer, error = %e, "Failed to grow receive buffer");
        }

        debug!(peer = %peer, block = %hash, attempt, "Block assigned");
        self.history
            .register(hash, Some(peer), format!("requested, attempt {attempt}"), now);
    }

    fn check_progress(&mut self, peer: PeerAddress, now: Timestamp) {
        let snapshot = self.streams.snapshot(&peer);
        let idle_timeout = self.config.max_idle_timeout();
        let download_timeout = self.config.max_download_timeout();

        let Some(record) = self.peers.get_mut(&peer) else {
            return;
        };
        let Some(block) = record.downloading_block() else {
            return;
        };
        if self.in_limbo.contains(&block) {
            return;
        }
        if let Some(snapshot) = snapshot {
            if record.update_progress(&snapshot, now) {
                self.block_last_activity.insert(block, now);
            }
        }

        let disconnected = record.connection_state() == PeerConnectionState::Disconnected;
        let stall = record.progress().and_then(|progress| {
            if progress.corrupted {
                Some(StallReason::Corrupted)
            } else if progress.idle_for(now) > idle_timeout {
                Some(StallReason::IdleTimeout)
            } else if progress.elapsed(now) > download_timeout {
                Some(StallReason::DownloadTimeout)
            } else if disconnected {
                Some(StallReason::Disconnected)
            } else {
                None
            }
        });
        if let Some(reason) = stall {
            self.move_to_limbo(peer, block, reason, now);
        }
    }

    fn move_to_limbo(&mut self, peer: PeerAddress, block: BlockHash, reason: StallReason, now: Timestamp) {
        warn!(peer = %peer, block = %block, reason = reason.as_str(), "Block download stalled");
        self.in_limbo.insert(block);
        self.block_last_activity.insert(block, now);
        self.pending.register_failure(block, peer, now);
        self.history.register(
            block,
            Some(peer),
            format!("moved to limbo: {}", reason.as_str()),
            now,
        );
    }

    fn reconcile_limbo(&mut self, now: Timestamp) {
        let timeout = self.config.inactivity_timeout_to_fail();
        for block in sorted(self.in_limbo.iter()) {
            if !self.pending.is_being_attempted(&block) {
                self.in_limbo.remove(&block);
                self.block_last_activity.remove(&block);
                continue;
            }
            if self.pending_to_cancel.contains(&block) {
                self.cancel_now(block, now);
                continue;
            }
            let last = self.block_last_activity.get(&block).copied().unwrap_or(now);
            if now.saturating_since(last) > timeout {
                self.process_failure(block, now);
            }
        }
    }

    fn retry_discarded(&mut self, now: Timestamp) {
        let timeout = self.config.retry_discarded_blocks_timeout();
        let mut expired: Vec<BlockHash> = self
            .discarded
            .iter()
            .filter(|(_, at)| now.saturating_since(**at) >= timeout)
            .map(|(hash, _)| *hash)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort();

        for hash in &expired {
            self.discarded.remove(hash);
            self.history.register(*hash, None, "discard cooldown over, queued again", now);
        }
        self.pending.add(&expired, true);
        info!(blocks = expired.len(), "Discarded blocks queued again");
    }

    fn update_busy_gauge(&mut self) {
        let handshaked = self.peers.values().filter(|r| r.is_handshaked()).count();
        if handshaked == 0 {
            return;
        }
        let busy = self
            .peers
            .values()
            .filter(|r| r.is_handshaked() && r.is_processing())
            .count();
        let percentage = u32::try_from(busy * 100 / handshaked).unwrap_or(100);
        self.busy_percentage = self.busy_percentage.max(percentage);
    }

    // =========================================================================
    // ATTEMPT RESOLUTION
    // =========================================================================

    /// Resolve a failed attempt: retry, discard or cancel the block.
    fn process_failure(&mut self, block: BlockHash, now: Timestamp) {
        for peer in self.holders(&block) {
            let Some(record) = self.peers.get_mut(&peer) else {
                continue;
            };
            let bytes = record.progress().map_or(0, |p| p.bytes_downloaded);
            if bytes == 0 {
                record.release();
            } else {
                record.discard();
                warn!(peer = %peer, block = %block, bytes, "Peer discarded after partial delivery");
            }
            self.pending.register_failure(block, peer, now);
            self.outbox.push(NetworkEvent::KeepAliveChanged {
                peer,
                enabled: true,
            });
            self.reset_buffer(&peer);
        }

        self.in_limbo.remove(&block);
        self.block_last_activity.remove(&block);
        self.partial_blocks.remove(&block);

        if self.pending_to_cancel.remove(&block) {
            self.mark_cancelled(block, now);
            return;
        }

        let attempts = self.pending.attempts(&block);
        if attempts < self.config.max_download_attempts {
            self.pending.add(&[block], true);
            self.total_reattempts += 1;
            info!(block = %block, attempts, "Block queued again after failed attempt");
            self.history.register(block, None, "queued again after failure", now);
        } else {
            self.pending.register_discarded(&block);
            self.discarded.insert(block, now);
            let reason = format!("{attempts} download attempts failed");
            warn!(block = %block, attempts, "Block discarded");
            self.history.register(block, None, format!("discarded: {reason}"), now);
            self.outbox.push(NetworkEvent::BlockDiscarded {
                block_hash: block,
                reason,
            });
        }
    }

    /// Resolve a delivered block.
    fn process_success(
        &mut self,
        peer: PeerAddress,
        header: BlockHeader,
        block_size: u64,
        now: Timestamp,
    ) {
        let hash = header.hash;
        if self.cancelled.contains(&hash) || self.downloaded.contains(&hash) {
            debug!(peer = %peer, block = %hash, "Block no longer wanted, releasing peers");
            for holder in self.holders(&hash) {
                self.free_peer(holder);
            }
            self.partial_blocks.remove(&hash);
            return;
        }

        let progress = self
            .peers
            .get(&peer)
            .and_then(PeerRecord::progress)
            .filter(|p| p.block_hash == hash)
            .cloned();
        let elapsed = progress
            .as_ref()
            .map(|p| p.elapsed(now))
            .unwrap_or_default();
        let attempts = self.pending.attempts(&hash);
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        self.outbox.push(NetworkEvent::BlockDownloaded {
            peer,
            header,
            block_size,
            duration_ms: elapsed_ms,
        });

        if progress.is_some() {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.record_speed(block_size, elapsed);
            }
        }
        for holder in self.holders(&hash) {
            self.free_peer(holder);
        }

        if attempts > 1 {
            info!(peer = %peer, block = %hash, attempts, "Block downloaded after retries");
        } else {
            debug!(peer = %peer, block = %hash, elapsed_ms, "Block downloaded");
        }

        self.pending.register_downloaded(&hash);
        self.downloaded.insert(hash);
        self.in_limbo.remove(&hash);
        self.pending_to_cancel.remove(&hash);
        self.partial_blocks.remove(&hash);
        self.block_last_activity.remove(&hash);
        self.discarded.remove(&hash);

        if self.config.history.clean_on_success {
            self.history.clear_block(&hash);
        } else {
            self.history.register(hash, Some(peer), "downloaded", now);
        }
    }

    /// Cancel an in-flight block right away.
    fn cancel_now(&mut self, block: BlockHash, now: Timestamp) {
        for peer in self.holders(&block) {
            self.free_peer(peer);
        }
        self.pending_to_cancel.remove(&block);
        self.in_limbo.remove(&block);
        self.block_last_activity.remove(&block);
        self.partial_blocks.remove(&block);
        self.mark_cancelled(block, now);
    }

    fn mark_cancelled(&mut self, block: BlockHash, now: Timestamp) {
        self.pending.register_cancelled(&block);
        self.discarded.remove(&block);
        self.cancelled.insert(block);
        debug!(block = %block, "Block download cancelled");
        self.history.register(block, None, "cancelled", now);
    }

    /// Return a peer to idle after its transfer ended.
    fn free_peer(&mut self, peer: PeerAddress) {
        if let Some(record) = self.peers.get_mut(&peer) {
            record.release();
        }
        self.outbox.push(NetworkEvent::KeepAliveChanged {
            peer,
            enabled: true,
        });
        self.reset_buffer(&peer);
    }

    fn reset_buffer(&self, peer: &PeerAddress) {
        if let Err(e) = self.streams.reset_buffer(peer) {
            warn!(peer = %peer, error = %e, "Failed to shrink receive buffer");
        }
    }

    /// Session ended: forget peers and put in-flight blocks back in the queue.
    fn stop(&mut self, now: Timestamp) {
        let mut in_flight: Vec<BlockHash> = self
            .peers
            .values_mut()
            .filter_map(|record| record.release().map(|p| p.block_hash))
            .chain(self.in_limbo.drain())
            .collect();
        in_flight.sort();
        in_flight.dedup();

        for block in &in_flight {
            self.block_last_activity.remove(block);
            if self.pending_to_cancel.remove(block) {
                self.mark_cancelled(*block, now);
            }
        }
        in_flight.retain(|b| !self.cancelled.contains(b));
        self.pending.add(&in_flight, true);

        self.peers.clear();
        self.partial_blocks.clear();
        self.last_rejections.clear();
        info!(requeued = in_flight.len(), "Network stopped, block download peers released");
    }

    fn holders(&self, block: &BlockHash) -> Vec<PeerAddress> {
        let mut holders: Vec<_> = self
            .peers
            .values()
            .filter(|r| r.downloading_block().as_ref() == Some(block))
            .map(PeerRecord::address)
            .collect();
        holders.sort();
        holders
    }

    fn is_assigned(&self, block: &BlockHash) -> bool {
        self.peers
            .values()
            .any(|r| r.downloading_block().as_ref() == Some(block))
    }

    fn bytes_in_flight(&self) -> u64 {
        self.peers
            .values()
            .filter_map(PeerRecord::progress)
            .map(|p| p.bytes_in_flight())
            .sum()
    }
}

fn sorted<'a>(hashes: impl Iterator<Item = &'a BlockHash>) -> Vec<BlockHash> {
    let mut hashes: Vec<_> = hashes.copied().collect();
    hashes.sort();
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryPeerStreams;

    fn hash(n: u8) -> BlockHash {
        BlockHash::new([n; 32])
    }

    fn addr(n: u8) -> PeerAddress {
        format!("10.0.0.{n}:8333").parse().unwrap()
    }

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn coordinator() -> (DownloadCoordinator, Arc<InMemoryPeerStreams>) {
        let streams = Arc::new(InMemoryPeerStreams::new());
        let coordinator =
            DownloadCoordinator::new(DownloadConfig::for_testing(), streams.clone()).unwrap();
        (coordinator, streams)
    }

    fn handshake(coordinator: &mut DownloadCoordinator, streams: &InMemoryPeerStreams, peer: PeerAddress) {
        streams.open(peer);
        coordinator.handle_event(NetworkEvent::PeerConnected { peer }, at(0));
        coordinator.handle_event(NetworkEvent::PeerHandshaked { peer }, at(0));
    }

    fn requests(events: &[NetworkEvent]) -> Vec<(PeerAddress, BlockHash)> {
        events
            .iter()
            .filter_map(|e| match e {
                NetworkEvent::GetBlockRequested { peer, block_hash } => Some((*peer, *block_hash)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DownloadConfig {
            tick_interval_ms: 0,
            ..DownloadConfig::for_testing()
        };
        let streams = Arc::new(InMemoryPeerStreams::new());
        assert!(DownloadCoordinator::new(config, streams).is_err());
    }

    #[test]
    fn test_handler_state_needs_client_and_peers() {
        let (mut coordinator, _) = coordinator();
        assert_eq!(coordinator.handler_state(), HandlerState::Running);

        coordinator.handle_event(NetworkEvent::MinHandshakedPeersLost { peers: 0 }, at(0));
        assert_eq!(coordinator.handler_state(), HandlerState::Paused);

        coordinator.handle_event(NetworkEvent::MinHandshakedPeersReached { peers: 3 }, at(0));
        coordinator.pause();
        assert_eq!(coordinator.handler_state(), HandlerState::Paused);

        coordinator.resume();
        assert_eq!(coordinator.handler_state(), HandlerState::Running);
    }

    #[test]
    fn test_assignment_emits_request_and_keep_alive() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(10));

        let events = coordinator.drain_events();
        assert_eq!(requests(&events), vec![(addr(1), hash(1))]);
        assert!(events.iter().any(|e| matches!(
            e,
            NetworkEvent::KeepAliveChanged { enabled: false, .. }
        )));
        assert_eq!(
            streams.buffer_size(&addr(1)),
            Some(crate::adapters::streams::BLOCK_BUFFER_SIZE)
        );
        assert_eq!(coordinator.attempts(&hash(1)), 1);
        assert!(coordinator.state().pending.is_empty());
    }

    #[test]
    fn test_download_skips_downloaded_unless_forced() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.handle_event(
            NetworkEvent::RawBlockDownloaded {
                peer: addr(1),
                header: BlockHeader::new(hash(1), hash(0), 1),
                block_size: 100,
            },
            at(0),
        );
        assert_eq!(coordinator.state().downloaded, vec![hash(1)]);

        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(1));
        assert!(coordinator.state().pending.is_empty());

        coordinator.download(DownloadRequest::new(vec![hash(1)]).force(), at(2));
        let state = coordinator.state();
        assert_eq!(state.pending, vec![hash(1)]);
        assert!(state.downloaded.is_empty());
    }

    #[test]
    fn test_unsolicited_block_reports_zero_duration() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.handle_event(
            NetworkEvent::RawBlockDownloaded {
                peer: addr(1),
                header: BlockHeader::new(hash(5), hash(4), 1),
                block_size: 10,
            },
            at(500),
        );
        let events = coordinator.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, NetworkEvent::BlockDownloaded { duration_ms: 0, .. })));
        assert_eq!(coordinator.peer(&addr(1)).unwrap().speed(), crate::domain::INITIAL_SPEED);
    }

    #[test]
    fn test_big_block_completes_on_last_chunk() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));
        coordinator.drain_events();

        let header = BlockHeader::new(hash(1), hash(0), 10);
        coordinator.handle_event(
            NetworkEvent::BlockHeaderDownloaded {
                peer: addr(1),
                header,
                block_size: 4_000,
                origin: EventOrigin::Wire,
            },
            at(100),
        );
        for _ in 0..2 {
            coordinator.handle_event(
                NetworkEvent::BlockTxsDownloaded {
                    peer: addr(1),
                    block_hash: hash(1),
                    txs_count: 4,
                    origin: EventOrigin::Wire,
                },
                at(200),
            );
        }
        assert!(coordinator.state().downloaded.is_empty());

        coordinator.handle_event(
            NetworkEvent::BlockTxsDownloaded {
                peer: addr(1),
                block_hash: hash(1),
                txs_count: 2,
                origin: EventOrigin::Wire,
            },
            at(1_000),
        );
        let state = coordinator.state();
        assert_eq!(state.downloaded, vec![hash(1)]);
        assert_eq!(coordinator.peer(&addr(1)).unwrap().speed(), 4_000);
        assert!(coordinator.peer(&addr(1)).unwrap().is_available());
    }

    #[test]
    fn test_lite_block_is_republished_and_not_reprocessed() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));
        coordinator.drain_events();

        coordinator.handle_event(
            NetworkEvent::LiteBlockDownloaded {
                peer: addr(1),
                header: BlockHeader::new(hash(1), hash(0), 3),
                block_size: 300,
            },
            at(10),
        );
        let events = coordinator.drain_events();
        let synthesized: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    NetworkEvent::BlockHeaderDownloaded { origin: EventOrigin::Downloader, .. }
                        | NetworkEvent::BlockTxsDownloaded { origin: EventOrigin::Downloader, .. }
                )
            })
            .cloned()
            .collect();
        assert_eq!(synthesized.len(), 2);

        for event in synthesized {
            coordinator.handle_event(event, at(20));
        }
        let downloaded = coordinator
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, NetworkEvent::BlockDownloaded { .. }))
            .count();
        assert_eq!(downloaded, 0);
        assert_eq!(coordinator.state().downloaded, vec![hash(1)]);
    }

    #[test]
    fn test_lite_block_not_republished_when_unwanted() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1), hash(2)]), at(0));
        coordinator.cancel(&[hash(1)], at(0));
        coordinator.handle_event(
            NetworkEvent::RawBlockDownloaded {
                peer: addr(1),
                header: BlockHeader::new(hash(2), hash(1), 1),
                block_size: 100,
            },
            at(0),
        );
        coordinator.drain_events();

        for block in [hash(1), hash(2)] {
            coordinator.handle_event(
                NetworkEvent::LiteBlockDownloaded {
                    peer: addr(1),
                    header: BlockHeader::new(block, hash(0), 1),
                    block_size: 100,
                },
                at(10),
            );
        }
        let events = coordinator.drain_events();
        assert!(!events.iter().any(|e| matches!(
            e,
            NetworkEvent::BlockHeaderDownloaded { .. }
                | NetworkEvent::BlockTxsDownloaded { .. }
                | NetworkEvent::BlockDownloaded { .. }
        )));

        let state = coordinator.state();
        assert_eq!(state.cancelled, vec![hash(1)]);
        assert_eq!(state.downloaded, vec![hash(2)]);
    }

    #[test]
    fn test_connect_after_handshake_keeps_peer_available() {
        let (mut coordinator, streams) = coordinator();
        streams.open(addr(1));
        coordinator.handle_event(NetworkEvent::PeerHandshaked { peer: addr(1) }, at(0));
        coordinator.handle_event(NetworkEvent::PeerConnected { peer: addr(1) }, at(0));
        assert!(coordinator.peer(&addr(1)).unwrap().is_handshaked());

        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(10));
        assert_eq!(requests(&coordinator.drain_events()), vec![(addr(1), hash(1))]);
    }

    #[test]
    fn test_connect_after_disconnect_reuses_record() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.handle_event(
            NetworkEvent::PeerDisconnected {
                peer: addr(1),
                reason: "closed".into(),
            },
            at(0),
        );
        coordinator.handle_event(NetworkEvent::PeerConnected { peer: addr(1) }, at(0));
        assert_eq!(
            coordinator.peer(&addr(1)).unwrap().connection_state(),
            PeerConnectionState::Connected
        );

        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(10));
        assert!(requests(&coordinator.drain_events()).is_empty());

        coordinator.handle_event(NetworkEvent::PeerHandshaked { peer: addr(1) }, at(20));
        coordinator.tick(at(30));
        assert_eq!(requests(&coordinator.drain_events()), vec![(addr(1), hash(1))]);
    }

    #[test]
    fn test_not_found_with_many_items_is_ignored() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));

        coordinator.handle_event(
            NetworkEvent::BlockNotFound {
                peer: addr(1),
                hashes: vec![hash(1), hash(2)],
            },
            at(10),
        );
        assert!(coordinator.peer(&addr(1)).unwrap().is_processing());

        coordinator.handle_event(
            NetworkEvent::BlockNotFound {
                peer: addr(1),
                hashes: vec![hash(1)],
            },
            at(20),
        );
        let state = coordinator.state();
        assert!(coordinator.peer(&addr(1)).unwrap().is_available());
        assert_eq!(state.pending, vec![hash(1)]);
        assert_eq!(state.total_reattempts, 1);
    }

    #[test]
    fn test_corrupted_stream_moves_block_to_limbo() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));

        streams.begin_block(addr(1), 1_000);
        streams.set_bytes_received(&addr(1), 100);
        coordinator.tick(at(10));
        streams.corrupt(&addr(1));
        coordinator.tick(at(20));

        let state = coordinator.state();
        assert_eq!(state.in_limbo, vec![hash(1)]);
        assert!(coordinator.peer(&addr(1)).unwrap().is_processing());

        let limit = DownloadConfig::for_testing().inactivity_timeout_to_fail_ms;
        coordinator.tick(at(20 + limit + 1));
        let state = coordinator.state();
        assert!(state.in_limbo.is_empty());
        assert_eq!(state.pending, vec![hash(1)]);
        assert_eq!(
            coordinator.peer(&addr(1)).unwrap().working_state(),
            crate::domain::PeerWorkingState::Discarded
        );
    }

    #[test]
    fn test_idle_timeout_moves_block_to_limbo() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));

        let idle = DownloadConfig::for_testing().max_idle_timeout_ms;
        coordinator.tick(at(idle + 1));
        assert_eq!(coordinator.state().in_limbo, vec![hash(1)]);
        assert!(coordinator
            .block_history(&hash(1))
            .iter()
            .any(|item| item.message.contains("idle timeout")));
    }

    #[test]
    fn test_bandwidth_cap_blocks_second_assignment() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        handshake(&mut coordinator, &streams, addr(2));
        coordinator.download(DownloadRequest::new(vec![hash(1), hash(2), hash(3)]), at(0));
        coordinator.tick(at(0));
        assert_eq!(requests(&coordinator.drain_events()).len(), 2);

        // Both peers are unmeasured, so the lower address is served first.
        streams.begin_block(addr(1), 20_000_000);
        streams.set_bytes_received(&addr(1), 1);
        coordinator.tick(at(10));

        coordinator.handle_event(
            NetworkEvent::RawBlockDownloaded {
                peer: addr(2),
                header: BlockHeader::new(hash(2), hash(1), 1),
                block_size: 10,
            },
            at(20),
        );
        coordinator.drain_events();
        coordinator.tick(at(30));

        assert!(requests(&coordinator.drain_events()).is_empty());
        let state = coordinator.state();
        assert!(state.bandwidth_restricted);
        assert_eq!(state.pending, vec![hash(3)]);
    }

    #[test]
    fn test_cancel_in_flight_is_deferred() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1), hash(2)]), at(0));
        coordinator.tick(at(0));

        coordinator.cancel(&[hash(1), hash(2)], at(5));
        let state = coordinator.state();
        assert_eq!(state.pending_to_cancel, vec![hash(1)]);
        assert_eq!(state.cancelled, vec![hash(2)]);
        assert!(state.pending.is_empty());

        coordinator.handle_event(
            NetworkEvent::BlockNotFound {
                peer: addr(1),
                hashes: vec![hash(1)],
            },
            at(10),
        );
        let state = coordinator.state();
        assert_eq!(state.cancelled, vec![hash(1), hash(2)]);
        assert!(state.pending_to_cancel.is_empty());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_busy_gauge_resets_on_snapshot() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        handshake(&mut coordinator, &streams, addr(2));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));

        assert_eq!(coordinator.state().busy_percentage, 50);
        assert_eq!(coordinator.state().busy_percentage, 0);
    }

    #[test]
    fn test_history_cleaned_on_success_when_configured() {
        let mut config = DownloadConfig::for_testing();
        config.history.clean_on_success = true;
        let streams = Arc::new(InMemoryPeerStreams::new());
        let mut coordinator = DownloadCoordinator::new(config, streams.clone()).unwrap();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1)]), at(0));
        coordinator.tick(at(0));
        assert!(!coordinator.block_history(&hash(1)).is_empty());

        coordinator.handle_event(
            NetworkEvent::RawBlockDownloaded {
                peer: addr(1),
                header: BlockHeader::new(hash(1), hash(0), 1),
                block_size: 10,
            },
            at(1_000),
        );
        assert!(coordinator.block_history(&hash(1)).is_empty());
    }

    #[test]
    fn test_net_stopped_requeues_in_flight_blocks() {
        let (mut coordinator, streams) = coordinator();
        handshake(&mut coordinator, &streams, addr(1));
        coordinator.download(DownloadRequest::new(vec![hash(1), hash(2)]), at(0));
        coordinator.tick(at(0));

        coordinator.handle_event(NetworkEvent::NetStopped, at(10));
        let state = coordinator.state();
        assert!(state.peers.is_empty());
        assert_eq!(state.pending, vec![hash(1), hash(2)]);
    }
}
