//! # Assignment Policy
//!
//! Decides whether a peer may download a given pending block.
//!
//! Evaluation order:
//!
//! 1. recent failure of this peer on this block (always checked)
//! 2. restricted mode: anything still mid-attempt is assigned
//! 3. exclusivity
//! 4. priority peers
//! 5. criteria ([`DownloadCriteria`])

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use shared_types::entities::{PeerAddress, Timestamp};

use crate::config::{DownloadCriteria, FallbackAction};

/// Why a peer was not given a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RejectionReason {
    /// The peer failed this block within the failure cooldown.
    TooManyRecentFailures,
    /// The block is reserved to another peer.
    OtherPeerHasExclusivity,
    /// Another peer with priority on the block is available.
    OtherPeerHasPriority,
    /// Another peer announced the block and should get it.
    OtherPeerIsAnnouncer,
    /// Nobody announced the block and the criteria says to wait.
    NoAnnouncer,
}

/// Outcome of evaluating one (peer, block) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The peer may download the block.
    Assigned,
    /// The peer may not download the block.
    Rejected(RejectionReason),
}

/// Per-block metadata the policy looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockContext<'a> {
    /// Peers that announced the block.
    pub announcers: Option<&'a HashSet<PeerAddress>>,
    /// Peer the block is reserved to.
    pub exclusive_peer: Option<PeerAddress>,
    /// Peers preferred for the block.
    pub priority_peers: Option<&'a HashSet<PeerAddress>>,
    /// Last time the candidate failed this block.
    pub last_failure: Option<Timestamp>,
}

/// The peers the candidate competes with.
#[derive(Debug, Clone, Copy)]
pub struct PeerPool<'a> {
    /// Handshaked, idle peers.
    pub available: &'a HashSet<PeerAddress>,
    /// Handshaked peers currently sending a block.
    pub busy: &'a HashSet<PeerAddress>,
}

/// Peer selection strategy.
#[derive(Debug, Clone)]
pub struct AssignmentPolicy {
    criteria: DownloadCriteria,
    failure_cooldown: Duration,
}

impl AssignmentPolicy {
    /// Create a policy.
    pub fn new(criteria: DownloadCriteria, failure_cooldown: Duration) -> Self {
        Self {
            criteria,
            failure_cooldown,
        }
    }

    /// Evaluate whether `candidate` may download a block.
    ///
    /// In `restricted` mode only blocks already mid-attempt are offered, and
    /// they go to any peer that passes the failure check.
    pub fn evaluate(
        &self,
        candidate: PeerAddress,
        block: &BlockContext<'_>,
        pool: &PeerPool<'_>,
        restricted: bool,
        now: Timestamp,
    ) -> Verdict {
        if let Some(failed_at) = block.last_failure {
            if now.saturating_since(failed_at) < self.failure_cooldown {
                return Verdict::Rejected(RejectionReason::TooManyRecentFailures);
            }
        }
        if restricted {
            return Verdict::Assigned;
        }

        if let Some(exclusive) = block.exclusive_peer {
            if exclusive != candidate {
                return Verdict::Rejected(RejectionReason::OtherPeerHasExclusivity);
            }
        }

        if let Some(priority) = block.priority_peers.filter(|p| !p.is_empty()) {
            let other_available = priority
                .iter()
                .any(|p| *p != candidate && pool.available.contains(p));
            if !priority.contains(&candidate) && other_available {
                return Verdict::Rejected(RejectionReason::OtherPeerHasPriority);
            }
        }

        match self.criteria {
            DownloadCriteria::AnyPeer => Verdict::Assigned,
            DownloadCriteria::AnnouncersOnly(policy) => {
                let announcers = block.announcers;
                if announcers.is_some_and(|a| a.contains(&candidate)) {
                    return Verdict::Assigned;
                }
                let announced_by = |set: &HashSet<PeerAddress>| {
                    announcers.is_some_and(|a| a.iter().any(|p| *p != candidate && set.contains(p)))
                };
                if announced_by(pool.available) {
                    return Verdict::Rejected(RejectionReason::OtherPeerIsAnnouncer);
                }
                if announced_by(pool.busy) {
                    return match policy.if_announcer_busy {
                        FallbackAction::DownloadFromAnyone => Verdict::Assigned,
                        FallbackAction::Wait => {
                            Verdict::Rejected(RejectionReason::OtherPeerIsAnnouncer)
                        }
                    };
                }
                match policy.if_no_announcer {
                    FallbackAction::DownloadFromAnyone => Verdict::Assigned,
                    FallbackAction::Wait => Verdict::Rejected(RejectionReason::NoAnnouncer),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnouncersPolicy;

    fn addr(n: u8) -> PeerAddress {
        format!("10.0.0.{n}:8333").parse().unwrap()
    }

    fn set(peers: &[PeerAddress]) -> HashSet<PeerAddress> {
        peers.iter().copied().collect()
    }

    fn announcers_only(if_no_announcer: FallbackAction, if_busy: FallbackAction) -> AssignmentPolicy {
        AssignmentPolicy::new(
            DownloadCriteria::AnnouncersOnly(AnnouncersPolicy {
                if_no_announcer,
                if_announcer_busy: if_busy,
            }),
            Duration::from_secs(30),
        )
    }

    const NOW: Timestamp = Timestamp::from_millis(100_000);

    #[test]
    fn test_any_peer_assigns() {
        let policy = AssignmentPolicy::new(DownloadCriteria::AnyPeer, Duration::from_secs(30));
        let available = set(&[addr(1)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        assert_eq!(
            policy.evaluate(addr(1), &BlockContext::default(), &pool, false, NOW),
            Verdict::Assigned
        );
    }

    #[test]
    fn test_recent_failure_checked_first() {
        let policy = AssignmentPolicy::new(DownloadCriteria::AnyPeer, Duration::from_secs(30));
        let available = set(&[addr(1)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        let block = BlockContext {
            last_failure: Some(Timestamp::from_millis(90_000)),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(addr(1), &block, &pool, true, NOW),
            Verdict::Rejected(RejectionReason::TooManyRecentFailures)
        );

        let block = BlockContext {
            last_failure: Some(Timestamp::from_millis(50_000)),
            ..Default::default()
        };
        assert_eq!(policy.evaluate(addr(1), &block, &pool, false, NOW), Verdict::Assigned);
    }

    #[test]
    fn test_restricted_mode_skips_remaining_checks() {
        let policy = announcers_only(FallbackAction::Wait, FallbackAction::Wait);
        let available = set(&[addr(1), addr(2)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        let block = BlockContext {
            exclusive_peer: Some(addr(2)),
            ..Default::default()
        };
        assert_eq!(policy.evaluate(addr(1), &block, &pool, true, NOW), Verdict::Assigned);
    }

    #[test]
    fn test_exclusivity() {
        let policy = AssignmentPolicy::new(DownloadCriteria::AnyPeer, Duration::from_secs(30));
        let available = set(&[addr(1), addr(2)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        let block = BlockContext {
            exclusive_peer: Some(addr(2)),
            ..Default::default()
        };
        assert_eq!(
            policy.evaluate(addr(1), &block, &pool, false, NOW),
            Verdict::Rejected(RejectionReason::OtherPeerHasExclusivity)
        );
        assert_eq!(policy.evaluate(addr(2), &block, &pool, false, NOW), Verdict::Assigned);
    }

    #[test]
    fn test_priority_only_rejects_when_other_priority_peer_available() {
        let policy = AssignmentPolicy::new(DownloadCriteria::AnyPeer, Duration::from_secs(30));
        let priority = set(&[addr(2)]);
        let block = BlockContext {
            priority_peers: Some(&priority),
            ..Default::default()
        };

        let available = set(&[addr(1), addr(2)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        assert_eq!(
            policy.evaluate(addr(1), &block, &pool, false, NOW),
            Verdict::Rejected(RejectionReason::OtherPeerHasPriority)
        );

        let available = set(&[addr(1)]);
        let busy = set(&[addr(2)]);
        let pool = PeerPool { available: &available, busy: &busy };
        assert_eq!(policy.evaluate(addr(1), &block, &pool, false, NOW), Verdict::Assigned);
    }

    #[test]
    fn test_announcer_gets_block() {
        let policy = announcers_only(FallbackAction::Wait, FallbackAction::Wait);
        let announcers = set(&[addr(1)]);
        let block = BlockContext {
            announcers: Some(&announcers),
            ..Default::default()
        };
        let available = set(&[addr(1), addr(2)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };

        assert_eq!(policy.evaluate(addr(1), &block, &pool, false, NOW), Verdict::Assigned);
        assert_eq!(
            policy.evaluate(addr(2), &block, &pool, false, NOW),
            Verdict::Rejected(RejectionReason::OtherPeerIsAnnouncer)
        );
    }

    #[test]
    fn test_busy_announcer_fallbacks() {
        let announcers = set(&[addr(1)]);
        let block = BlockContext {
            announcers: Some(&announcers),
            ..Default::default()
        };
        let available = set(&[addr(2)]);
        let busy = set(&[addr(1)]);
        let pool = PeerPool { available: &available, busy: &busy };

        let wait = announcers_only(FallbackAction::Wait, FallbackAction::Wait);
        assert_eq!(
            wait.evaluate(addr(2), &block, &pool, false, NOW),
            Verdict::Rejected(RejectionReason::OtherPeerIsAnnouncer)
        );

        let anyone = announcers_only(FallbackAction::Wait, FallbackAction::DownloadFromAnyone);
        assert_eq!(anyone.evaluate(addr(2), &block, &pool, false, NOW), Verdict::Assigned);
    }

    #[test]
    fn test_no_announcer_fallbacks() {
        let available = set(&[addr(2)]);
        let busy = HashSet::new();
        let pool = PeerPool { available: &available, busy: &busy };
        let block = BlockContext::default();

        let wait = announcers_only(FallbackAction::Wait, FallbackAction::Wait);
        assert_eq!(
            wait.evaluate(addr(2), &block, &pool, false, NOW),
            Verdict::Rejected(RejectionReason::NoAnnouncer)
        );

        let anyone = announcers_only(FallbackAction::DownloadFromAnyone, FallbackAction::Wait);
        assert_eq!(anyone.evaluate(addr(2), &block, &pool, false, NOW), Verdict::Assigned);
    }
}
