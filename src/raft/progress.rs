//! Vote tallies and per-follower replication progress.
//!
//! Both structures are leader/candidate bookkeeping only; they are dropped
//! and rebuilt on every role transition.

use super::message::NodeId;

/// Maximum supported cluster size: node ids index into a u64 bitset.
pub const MAX_CLUSTER_SIZE: u32 = 64;

/// A compact set of node ids backed by a u64 bitset.
///
/// Insert and count are single bit operations; the majority check is a
/// popcount against the configured cluster size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSet(u64);

impl PeerSet {
    pub fn new() -> Self {
        PeerSet(0)
    }

    #[inline]
    pub fn insert(&mut self, id: NodeId) {
        debug_assert!(id < MAX_CLUSTER_SIZE);
        self.0 |= 1u64 << id;
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        debug_assert!(id < MAX_CLUSTER_SIZE);
        (self.0 & (1u64 << id)) != 0
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Strict majority of `cluster_size` members.
    #[inline]
    pub fn has_majority(&self, cluster_size: u32) -> bool {
        self.count() > cluster_size / 2
    }
}

/// The leader's per-peer replication tables.
///
/// One slot per node, including the leader itself; the leader's own slots
/// are kept current as it appends locally and broadcasts rounds, so
/// majority computations can treat every slot uniformly.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Index of the next entry to send to each peer.
    next_index: Vec<u64>,
    /// Highest index known replicated on each peer (`None` = nothing yet).
    match_index: Vec<Option<u64>>,
    /// Highest heartbeat round acknowledged by each peer.
    acked_round: Vec<Option<u64>>,
}

impl Progress {
    /// Fresh tables for a new leadership: `next = len(log)` for everyone,
    /// nothing known replicated except the leader's own log.
    pub fn new(cluster_size: u32, self_id: NodeId, log_len: u64) -> Self {
        assert!(cluster_size <= MAX_CLUSTER_SIZE);
        let n = cluster_size as usize;
        let mut progress = Progress {
            next_index: vec![log_len; n],
            match_index: vec![None; n],
            acked_round: vec![None; n],
        };
        progress.match_index[self_id as usize] = log_len.checked_sub(1);
        progress
    }

    pub fn next(&self, peer: NodeId) -> u64 {
        self.next_index[peer as usize]
    }

    pub fn matched(&self, peer: NodeId) -> Option<u64> {
        self.match_index[peer as usize]
    }

    /// A successful replication response: advance match monotonically and
    /// derive next from it.
    pub fn record_success(&mut self, peer: NodeId, match_index: Option<u64>) {
        let slot = &mut self.match_index[peer as usize];
        *slot = (*slot).max(match_index);
        self.next_index[peer as usize] = slot.map_or(0, |m| m + 1);
    }

    /// A failed continuity check: back off by one, never below zero.
    pub fn record_failure(&mut self, peer: NodeId) {
        let next = &mut self.next_index[peer as usize];
        *next = next.saturating_sub(1);
    }

    /// The leader's own log advanced (local append).
    pub fn record_local(&mut self, self_id: NodeId, log_len: u64) {
        self.match_index[self_id as usize] = log_len.checked_sub(1);
        self.next_index[self_id as usize] = log_len;
    }

    pub fn record_ack(&mut self, peer: NodeId, round: u64) {
        let slot = &mut self.acked_round[peer as usize];
        *slot = (*slot).max(Some(round));
    }

    /// Largest index replicated on a strict majority.
    ///
    /// Descending sort puts the answer at position `n / 2`: that many
    /// slots at or above it is exactly a strict majority.
    pub fn majority_match(&self) -> Option<u64> {
        let mut sorted = self.match_index.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted[sorted.len() / 2]
    }

    /// Largest heartbeat round acknowledged by a strict majority.
    pub fn majority_round(&self) -> Option<u64> {
        let mut sorted = self.acked_round.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted[sorted.len() / 2]
    }
}
