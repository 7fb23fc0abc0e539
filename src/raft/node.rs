use std::collections::VecDeque;
use std::io;
use std::mem;

use log::{debug, warn};

use crate::store::{BootState, Storage};

use super::log::{EntryId, Log, LogEntry};
use super::message::{Envelope, Message, NodeId};
use super::progress::{PeerSet, Progress};

/// Role of a Raft server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: accepts entries from the leader, votes when asked.
    Follower,
    /// Running an election for the current term.
    Candidate,
    /// Drives replication and commit for the current term.
    Leader,
}

/// An input to the event-step function.
///
/// Timers live outside the core: the driver fires `ElectionTimeout` at a
/// randomized interval and `HeartbeatTimeout` at a fixed shorter one. Both
/// may be fired regardless of role; the core ignores what does not apply.
#[derive(Debug)]
pub enum Event {
    Receive(Envelope),
    ElectionTimeout,
    HeartbeatTimeout,
}

/// Where a client command landed in the leader's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub term: u64,
    pub index: u64,
}

/// This server is not the leader; `hint` is its best guess at who is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotLeader {
    pub hint: Option<NodeId>,
}

/// Handle for an in-flight leadership confirmation.
pub type ConfirmToken = u64;

/// A single Raft server: the role state machine, the log, and the
/// event-step function.
///
/// Every entry point runs to completion without suspending and buffers its
/// outgoing messages in an outbox instead of performing I/O; the node is
/// therefore deterministic given an event sequence, which is what the
/// simulator exploits. The surrounding driver owns sockets and timers and
/// must serialize all calls into one node.
///
/// Storage writes happen inside the event step, before the response that
/// depends on them is buffered; a storage error is fatal and propagates out
/// of the step untouched.
pub struct RaftNode<S: Storage> {
    id: NodeId,
    cluster_size: u32,

    // Persistent state (mirrored through `storage`).
    current_term: u64,
    voted_for: Option<NodeId>,
    log: Log,

    // Volatile state.
    role: Role,
    commit_index: Option<u64>,
    /// Set on any valid leader RPC or vote grant; cleared by the election
    /// timeout tick that observes it.
    heard_from_leader: bool,
    /// Last known leader, for redirecting clients.
    leader_hint: Option<NodeId>,

    // Leader state, rebuilt on every election win.
    progress: Option<Progress>,
    /// Counter stamped into AppendEntries; the read barrier compares
    /// majority-acknowledged rounds against it.
    heartbeat_round: u64,

    // Candidate state.
    votes: Option<PeerSet>,

    // Leadership confirmations (read barrier).
    next_confirm_token: ConfirmToken,
    pending_confirms: VecDeque<(ConfirmToken, u64)>,
    confirmations: Vec<(ConfirmToken, bool)>,

    outbox: Vec<Envelope>,
    storage: S,
}

impl<S: Storage> RaftNode<S> {
    /// Build a server from recovered (or empty) persistent state.
    pub fn new(id: NodeId, cluster_size: u32, storage: S, boot: BootState) -> Self {
        assert!(cluster_size >= 1 && id < cluster_size);
        RaftNode {
            id,
            cluster_size,
            current_term: boot.current_term,
            voted_for: boot.voted_for,
            log: Log::from_entries(boot.entries),
            role: Role::Follower,
            commit_index: None,
            heard_from_leader: false,
            leader_hint: None,
            progress: None,
            heartbeat_round: 0,
            votes: None,
            next_confirm_token: 0,
            pending_confirms: VecDeque::new(),
            confirmations: Vec::new(),
            outbox: Vec::new(),
            storage,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.commit_index
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.leader_hint
    }

    pub fn heard_from_leader(&self) -> bool {
        self.heard_from_leader
    }

    /// Reclaim the storage handle (e.g. to rebuild the node after a
    /// simulated crash).
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Messages produced since the last call, for the driver to transmit.
    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        mem::take(&mut self.outbox)
    }

    /// Resolved leadership confirmations since the last call.
    pub fn take_confirmations(&mut self) -> Vec<(ConfirmToken, bool)> {
        mem::take(&mut self.confirmations)
    }

    // =========================================================================
    // EVENT STEP
    // =========================================================================

    /// Process one event to completion.
    pub fn step(&mut self, event: Event) -> io::Result<()> {
        match event {
            Event::Receive(env) => self.handle_message(env)?,
            Event::ElectionTimeout => self.on_election_timeout()?,
            Event::HeartbeatTimeout => self.on_heartbeat_timeout(),
        }
        debug_assert!(self.commit_index.map_or(true, |c| c < self.log.len()));
        Ok(())
    }

    fn handle_message(&mut self, env: Envelope) -> io::Result<()> {
        debug_assert_eq!(env.to, self.id);
        let term = env.msg.term();

        if term > self.current_term {
            self.become_follower(term)?;
        }
        if term < self.current_term {
            warn!(
                "node {}: rejecting stale message (term {} < {}): {:?}",
                self.id, term, self.current_term, env.msg
            );
            match env.msg {
                Message::RequestVote { candidate_id, .. } => {
                    let reply = Message::RequestVoteResponse {
                        term: self.current_term,
                        voter_id: self.id,
                        granted: false,
                    };
                    self.send(candidate_id, reply);
                }
                Message::AppendEntries {
                    leader_id, round, ..
                } => {
                    let reply = Message::AppendEntriesResponse {
                        term: self.current_term,
                        from: self.id,
                        success: false,
                        match_index: None,
                        round,
                    };
                    self.send(leader_id, reply);
                }
                // Stale responses carry no obligation.
                _ => {}
            }
            return Ok(());
        }

        match env.msg {
            Message::RequestVote {
                candidate_id, last, ..
            } => self.handle_request_vote(candidate_id, last),
            Message::RequestVoteResponse {
                voter_id, granted, ..
            } => {
                self.handle_vote_response(voter_id, granted);
                Ok(())
            }
            Message::AppendEntries {
                leader_id,
                prev,
                entries,
                leader_commit,
                round,
                ..
            } => self.handle_append_entries(leader_id, prev, entries, leader_commit, round),
            Message::AppendEntriesResponse {
                from,
                success,
                match_index,
                round,
                ..
            } => {
                self.handle_append_response(from, success, match_index, round);
                Ok(())
            }
        }
    }

    fn on_election_timeout(&mut self) -> io::Result<()> {
        match self.role {
            // Leaders keep their own time.
            Role::Leader => Ok(()),
            Role::Follower | Role::Candidate => {
                if self.heard_from_leader {
                    self.heard_from_leader = false;
                    return Ok(());
                }
                self.become_candidate()
            }
        }
    }

    fn on_heartbeat_timeout(&mut self) {
        if self.role == Role::Leader {
            self.broadcast_append_entries();
        }
    }

    // =========================================================================
    // ELECTIONS
    // =========================================================================

    fn handle_request_vote(&mut self, candidate_id: NodeId, last: Option<EntryId>) -> io::Result<()> {
        let granted = if let Some(votee) = self.voted_for {
            // One vote per term; re-granting the same candidate is a no-op.
            votee == candidate_id
        } else if up_to_date_key(last) >= up_to_date_key(self.log.last()) {
            self.voted_for = Some(candidate_id);
            // A granted vote also resets the election timer, so the voter
            // does not immediately stand against its chosen candidate.
            self.heard_from_leader = true;
            // The vote must be durable before the candidate can count it.
            self.storage.persist_vote(self.current_term, self.voted_for)?;
            true
        } else {
            false
        };
        debug!(
            "node {}: vote for {} in term {}: granted={} (mine={:?}, theirs={:?})",
            self.id,
            candidate_id,
            self.current_term,
            granted,
            self.log.last(),
            last
        );
        let reply = Message::RequestVoteResponse {
            term: self.current_term,
            voter_id: self.id,
            granted,
        };
        self.send(candidate_id, reply);
        Ok(())
    }

    fn handle_vote_response(&mut self, voter_id: NodeId, granted: bool) {
        if self.role != Role::Candidate {
            // A delayed vote after winning or losing the election.
            return;
        }
        if !granted {
            return;
        }
        let votes = self.votes.as_mut().expect("candidate has a vote tally");
        votes.insert(voter_id);
        let won = votes.has_majority(self.cluster_size);
        if won {
            self.become_leader();
        }
    }

    fn become_candidate(&mut self) -> io::Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.progress = None;
        let mut votes = PeerSet::new();
        votes.insert(self.id);
        self.votes = Some(votes);
        // Term and self-vote must hit disk before the vote requests go out.
        self.storage.persist_vote(self.current_term, self.voted_for)?;
        warn!(
            "node {} became CANDIDATE, term {}",
            self.id, self.current_term
        );

        let last = self.log.last();
        for peer in self.peers() {
            self.send(
                peer,
                Message::RequestVote {
                    term: self.current_term,
                    candidate_id: self.id,
                    last,
                },
            );
        }
        // A single-node cluster is its own majority.
        if votes.has_majority(self.cluster_size) {
            self.become_leader();
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        warn!("node {} became LEADER, term {}", self.id, self.current_term);
        self.role = Role::Leader;
        self.votes = None;
        self.progress = Some(Progress::new(self.cluster_size, self.id, self.log.len()));
        self.leader_hint = Some(self.id);
        // Announce immediately; this also suppresses rival elections.
        self.broadcast_append_entries();
    }

    /// Higher term observed: adopt it and revert to follower.
    fn become_follower(&mut self, new_term: u64) -> io::Result<()> {
        assert!(new_term > self.current_term);
        warn!(
            "node {}: term {} -> {}, becoming FOLLOWER",
            self.id, self.current_term, new_term
        );
        self.current_term = new_term;
        self.voted_for = None;
        self.step_down();
        self.storage.persist_vote(self.current_term, None)
    }

    /// Drop leader/candidate state without touching the term.
    fn step_down(&mut self) {
        self.role = Role::Follower;
        self.progress = None;
        self.votes = None;
        self.fail_pending_confirmations();
    }

    // =========================================================================
    // LOG REPLICATION
    // =========================================================================

    fn handle_append_entries(
        &mut self,
        leader_id: NodeId,
        prev: Option<EntryId>,
        entries: Vec<LogEntry>,
        leader_commit: Option<u64>,
        round: u64,
    ) -> io::Result<()> {
        // Two leaders in one term would have required two disjoint
        // majorities of voters.
        assert!(
            self.role != Role::Leader,
            "node {}: second leader {} observed in term {}",
            self.id,
            leader_id,
            self.current_term
        );
        if self.role == Role::Candidate {
            debug!(
                "node {}: lost election to {} in term {}",
                self.id, leader_id, self.current_term
            );
            self.step_down();
        }
        self.heard_from_leader = true;
        self.leader_hint = Some(leader_id);

        let reply = match self.log.append_entries(prev, &entries) {
            None => {
                debug!(
                    "node {}: append rejected at prev={:?} (log len {})",
                    self.id,
                    prev,
                    self.log.len()
                );
                Message::AppendEntriesResponse {
                    term: self.current_term,
                    from: self.id,
                    success: false,
                    match_index: None,
                    round,
                }
            }
            Some(outcome) => {
                // Mirror the change into the log file before replying.
                if outcome.truncated {
                    self.storage.persist_rewrite(self.log.entries())?;
                } else if let Some(from) = outcome.appended_from {
                    self.storage.persist_append(from, self.log.tail_from(from))?;
                }
                let replicated = match entries.len() as u64 {
                    0 => prev.map(|p| p.index),
                    n => Some(prev.map_or(0, |p| p.index + 1) + n - 1),
                };
                // Committed means replicated on a majority; this follower
                // may only trust that up to the prefix it just verified.
                self.advance_commit(leader_commit.min(replicated));
                Message::AppendEntriesResponse {
                    term: self.current_term,
                    from: self.id,
                    success: true,
                    match_index: replicated,
                    round,
                }
            }
        };
        self.send(leader_id, reply);
        Ok(())
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        match_index: Option<u64>,
        round: u64,
    ) {
        if self.role != Role::Leader {
            // Voted off the island; the response is from a past life.
            return;
        }
        let progress = self.progress.as_mut().expect("leader has progress tables");
        if success {
            progress.record_success(from, match_index);
            progress.record_ack(from, round);
            self.maybe_advance_leader_commit();
            self.fire_ready_confirmations();
        } else {
            progress.record_failure(from);
            // Retry straight away with the earlier prefix.
            self.send_append_to_peer(from);
        }
    }

    /// Send each peer everything from its `next_index` on. An up-to-date
    /// peer gets an empty batch: the heartbeat.
    fn broadcast_append_entries(&mut self) {
        self.heartbeat_round += 1;
        let round = self.heartbeat_round;
        if let Some(progress) = self.progress.as_mut() {
            progress.record_ack(self.id, round);
        }
        for peer in self.peers() {
            self.send_append_to_peer(peer);
        }
        // A single-node cluster confirms its own rounds.
        self.fire_ready_confirmations();
    }

    fn send_append_to_peer(&mut self, peer: NodeId) {
        let next = match &self.progress {
            Some(progress) => progress.next(peer),
            None => return,
        };
        let prev = next.checked_sub(1).map(|index| EntryId {
            index,
            term: self.log.term_at(index).expect("next_index within log"),
        });
        let entries = self.log.tail_from(next).to_vec();
        let msg = Message::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev,
            entries,
            leader_commit: self.commit_index,
            round: self.heartbeat_round,
        };
        self.send(peer, msg);
    }

    /// Figure-8 rule: the leader may only count replicas for an entry of
    /// its own term; committing it commits all predecessors implicitly.
    fn maybe_advance_leader_commit(&mut self) {
        let candidate = match &self.progress {
            Some(progress) => progress.majority_match(),
            None => return,
        };
        if candidate <= self.commit_index {
            return;
        }
        let n = candidate.expect("candidate exceeds commit_index");
        if self.log.term_at(n) == Some(self.current_term) {
            self.advance_commit(candidate);
        }
    }

    fn advance_commit(&mut self, target: Option<u64>) {
        if target > self.commit_index {
            assert!(
                target.map_or(true, |t| t < self.log.len()),
                "node {}: commit_index {:?} beyond log of length {}",
                self.id,
                target,
                self.log.len()
            );
            debug!(
                "node {}: commit {:?} -> {:?}",
                self.id, self.commit_index, target
            );
            self.commit_index = target;
        }
    }

    // =========================================================================
    // CLIENT SURFACE
    // =========================================================================

    /// Append a client command to the leader's log.
    ///
    /// The outer result is a storage fault (fatal); the inner one is the
    /// protocol answer. Replication happens on the next heartbeat; the
    /// command is committed once `commit_index` reaches the receipt index
    /// within the receipt term.
    pub fn client_append(
        &mut self,
        command: Vec<u8>,
    ) -> io::Result<Result<Receipt, NotLeader>> {
        if self.role != Role::Leader {
            return Ok(Err(NotLeader {
                hint: self.leader_hint,
            }));
        }
        let prev = self.log.last();
        let entry = LogEntry::new(self.current_term, command);
        let outcome = self
            .log
            .append_entries(prev, std::slice::from_ref(&entry))
            .expect("local append is always continuous");
        let index = outcome.appended_from.expect("local append adds an entry");
        self.storage.persist_append(index, self.log.tail_from(index))?;

        let len = self.log.len();
        let progress = self.progress.as_mut().expect("leader has progress tables");
        progress.record_local(self.id, len);
        // Single-node clusters commit on append alone.
        self.maybe_advance_leader_commit();
        Ok(Ok(Receipt {
            term: self.current_term,
            index,
        }))
    }

    /// Begin a leadership confirmation (the read barrier).
    ///
    /// The returned token resolves through [`take_confirmations`]: `true`
    /// once a majority has acknowledged a heartbeat round started after
    /// this call, `false` as soon as leadership or the term is lost. A
    /// non-leader resolves `false` immediately.
    ///
    /// [`take_confirmations`]: RaftNode::take_confirmations
    pub fn request_leader_confirm(&mut self) -> ConfirmToken {
        let token = self.next_confirm_token;
        self.next_confirm_token += 1;
        if self.role == Role::Leader {
            self.pending_confirms
                .push_back((token, self.heartbeat_round + 1));
        } else {
            self.confirmations.push((token, false));
        }
        token
    }

    fn fire_ready_confirmations(&mut self) {
        let majority_round = match &self.progress {
            Some(progress) => progress.majority_round(),
            None => return,
        };
        while let Some(&(token, barrier)) = self.pending_confirms.front() {
            if Some(barrier) <= majority_round {
                self.pending_confirms.pop_front();
                self.confirmations.push((token, true));
            } else {
                break;
            }
        }
    }

    fn fail_pending_confirmations(&mut self) {
        while let Some((token, _)) = self.pending_confirms.pop_front() {
            self.confirmations.push((token, false));
        }
    }

    // =========================================================================
    // PLUMBING
    // =========================================================================

    fn peers(&self) -> Vec<NodeId> {
        (0..self.cluster_size).filter(|&p| p != self.id).collect()
    }

    fn send(&mut self, to: NodeId, msg: Message) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            msg,
        });
    }

    /// Assert the universal state invariants. The simulator runs this after
    /// every event step; a violation is a bug and panics.
    pub fn check_invariants(&self) {
        assert!(
            self.log.terms_monotonic(),
            "node {}: log terms not monotonic",
            self.id
        );
        assert!(
            self.commit_index.map_or(true, |c| c < self.log.len()),
            "node {}: commit_index {:?} beyond log of length {}",
            self.id,
            self.commit_index,
            self.log.len()
        );
        if let Some(last) = self.log.last() {
            assert!(
                last.term <= self.current_term,
                "node {}: log entry from the future (term {} > {})",
                self.id,
                last.term,
                self.current_term
            );
        }
        match self.role {
            Role::Leader => {
                assert!(self.progress.is_some() && self.votes.is_none());
            }
            Role::Candidate => {
                assert!(self.progress.is_none() && self.votes.is_some());
                assert_eq!(self.voted_for, Some(self.id));
            }
            Role::Follower => {
                assert!(self.progress.is_none());
            }
        }
    }

    /// Test-only: seize leadership without an election, the way the
    /// paper's figures start mid-history.
    #[cfg(test)]
    pub(crate) fn force_leader(&mut self) {
        self.become_leader();
        self.outbox.clear();
    }

    /// Test-only: fire the heartbeat as if the timer ticked.
    #[cfg(test)]
    pub(crate) fn send_heartbeats(&mut self) {
        self.on_heartbeat_timeout();
    }
}

/// Up-to-date ordering for the vote guard: compare `(last_term,
/// last_index)` lexicographically, with the empty log smallest.
fn up_to_date_key(last: Option<EntryId>) -> Option<(u64, u64)> {
    last.map(|e| (e.term, e.index))
}
