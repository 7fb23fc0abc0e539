//! Consensus integration tests: clusters of in-memory nodes wired directly
//! to each other through a synchronous message pump.
//!
//! The log histories and election choreography follow Figures 6, 7 and 8
//! of the Raft paper.

use std::mem;

use crate::app::{Applier, KvCommand, KvStore};
use crate::store::{BootState, MemoryStorage};

use super::log::{EntryId, LogEntry};
use super::message::{Envelope, Message, NodeId};
use super::node::{Event, RaftNode, Role};

type TestNode = RaftNode<MemoryStorage>;

fn cmd(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

fn entry(term: u64, text: &str) -> LogEntry {
    LogEntry::new(term, cmd(text))
}

/// Entries whose command is the term rendered as text, as in the paper's
/// figures.
fn entries_with_terms(terms: &[u64]) -> Vec<LogEntry> {
    terms
        .iter()
        .map(|&t| LogEntry::new(t, t.to_string().into_bytes()))
        .collect()
}

/// Build a node whose storage already agrees with its boot state, as a
/// real recovery would leave it.
fn booted_node(id: NodeId, n: u32, boot: BootState) -> TestNode {
    let storage = MemoryStorage::from_boot(&boot);
    RaftNode::new(id, n, storage, boot)
}

fn blank_cluster(n: u32) -> Vec<TestNode> {
    (0..n)
        .map(|id| booted_node(id, n, BootState::default()))
        .collect()
}

/// A cluster recovered mid-history: each node boots from the given log,
/// with its term set to the highest term it has seen.
fn seeded_cluster(term_histories: &[&[u64]]) -> Vec<TestNode> {
    let n = term_histories.len() as u32;
    term_histories
        .iter()
        .enumerate()
        .map(|(id, terms)| {
            let boot = BootState {
                current_term: terms.iter().copied().max().unwrap_or(0),
                voted_for: None,
                entries: entries_with_terms(terms),
            };
            booted_node(id as u32, n, boot)
        })
        .collect()
}

/// Pump messages until the cluster quiesces, skipping excluded nodes
/// entirely (they neither send nor receive — a partition).
fn drain_with(nodes: &mut Vec<TestNode>, exclude: &[NodeId]) -> usize {
    let mut steps = 0;
    loop {
        let mut mail = Vec::new();
        for node in nodes.iter_mut() {
            if exclude.contains(&node.id()) {
                continue;
            }
            mail.extend(node.take_outbox());
        }
        if mail.is_empty() {
            return steps;
        }
        for env in mail {
            if exclude.contains(&env.to) {
                continue;
            }
            // Round-trip the wire encoding, as a real transport would.
            let env = Envelope::from_bytes(&env.to_bytes()).unwrap();
            let to = env.to as usize;
            nodes[to].step(Event::Receive(env)).unwrap();
            steps += 1;
        }
        assert!(steps < 100_000, "message pump did not quiesce");
    }
}

fn drain(nodes: &mut Vec<TestNode>) -> usize {
    drain_with(nodes, &[])
}

/// Fire the election timer until the node stands for election (the first
/// firing may only clear `heard_from_leader`).
fn start_election(node: &mut TestNode) {
    node.step(Event::ElectionTimeout).unwrap();
    if node.role() != Role::Candidate {
        node.step(Event::ElectionTimeout).unwrap();
    }
    assert_eq!(node.role(), Role::Candidate);
}

/// Elect `id` from a quiet cluster and settle the fallout.
fn elect(nodes: &mut Vec<TestNode>, id: usize) {
    start_election(&mut nodes[id]);
    drain(nodes);
    assert!(nodes[id].is_leader());
}

fn heartbeat(nodes: &mut Vec<TestNode>, id: usize) {
    nodes[id].send_heartbeats();
}

/// Crash a node and bring it back with only its persisted state: the
/// volatile role, commit index and progress are gone.
fn restart_in_place(nodes: &mut Vec<TestNode>, id: usize) {
    let n = nodes[id].cluster_size();
    let placeholder = RaftNode::new(id as u32, n, MemoryStorage::new(), BootState::default());
    let old = mem::replace(&mut nodes[id], placeholder);
    let storage = old.into_storage();
    let boot = storage.boot_state();
    nodes[id] = RaftNode::new(id as u32, n, storage, boot);
}

fn commit_indexes(nodes: &[TestNode]) -> Vec<Option<u64>> {
    nodes.iter().map(|n| n.commit_index()).collect()
}

#[test]
fn elects_a_leader_from_cold_start() {
    let mut nodes = blank_cluster(3);
    elect(&mut nodes, 0);
    assert_eq!(nodes[0].current_term(), 1);
    for follower in &nodes[1..] {
        assert_eq!(follower.role(), Role::Follower);
        assert_eq!(follower.current_term(), 1);
    }
    for node in &nodes {
        node.check_invariants();
    }
}

#[test]
fn leader_appends_and_replicates() {
    let mut nodes = blank_cluster(2);
    elect(&mut nodes, 0);

    let receipt = nodes[0].client_append(cmd("foo")).unwrap().unwrap();
    assert_eq!(receipt.index, 0);
    assert_eq!(receipt.term, 1);
    assert_eq!(nodes[0].log().len(), 1);

    let receipt = nodes[0].client_append(cmd("bar")).unwrap().unwrap();
    assert_eq!(receipt.index, 1);

    // Nothing moves until the heartbeat carries the entries.
    assert_eq!(drain(&mut nodes), 0);
    heartbeat(&mut nodes, 0);
    assert!(drain(&mut nodes) > 0);
    assert_eq!(nodes[1].log().entries(), nodes[0].log().entries());
    assert_eq!(nodes[0].commit_index(), Some(1));

    // Commit reaches the follower on the next round.
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    assert_eq!(nodes[1].commit_index(), Some(1));
}

#[test]
fn client_append_redirects_to_leader() {
    let mut nodes = blank_cluster(3);
    elect(&mut nodes, 0);
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);

    let err = nodes[1].client_append(cmd("nope")).unwrap().unwrap_err();
    assert_eq!(err.hint, Some(0));
}

/// Figure 6: five logs in various states of repair.
const FIGURE_6: [&[u64]; 5] = [
    &[1, 1, 1, 2, 3, 3, 3, 3],
    &[1, 1, 1, 2, 3],
    &[1, 1, 1, 2, 3, 3, 3, 3],
    &[1, 1],
    &[1, 1, 1, 2, 3, 3, 3],
];

/// Figure 7: the term histories of a term-8 leader and followers (a)-(f).
const FIGURE_7: [&[u64]; 7] = [
    &[1, 1, 1, 4, 4, 5, 5, 6, 6, 6],
    &[1, 1, 1, 4, 4, 5, 5, 6, 6],
    &[1, 1, 1, 4],
    &[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 6],
    &[1, 1, 1, 4, 4, 5, 5, 6, 6, 6, 7, 7],
    &[1, 1, 1, 4, 4, 4, 4],
    &[1, 1, 1, 2, 2, 2, 3, 3, 3, 3, 3],
];

fn synchronize_histories(histories: &[&[u64]], leader_term: u64) {
    let mut nodes = seeded_cluster(histories);
    // Install node 0 as leader the way the figures assume, mid-history.
    let boot = BootState {
        current_term: leader_term,
        voted_for: None,
        entries: entries_with_terms(histories[0]),
    };
    nodes[0] = booted_node(0, histories.len() as u32, boot);
    nodes[0].force_leader();

    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    let leader_log = nodes[0].log().entries().to_vec();
    for node in nodes.iter() {
        // Longer histories (Figure 7 (c) and (d)) are not clipped by
        // replication alone.
        assert!(node.log().len() >= leader_log.len() as u64);
        assert_eq!(&node.log().entries()[..leader_log.len()], &leader_log[..]);
    }

    // One novel entry makes every log identical.
    nodes[0].client_append(cmd("novel")).unwrap().unwrap();
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    let leader_log = nodes[0].log().entries().to_vec();
    let expected_commit = Some(leader_log.len() as u64 - 1);
    for node in nodes.iter() {
        assert_eq!(node.log().entries(), &leader_log[..]);
        assert_eq!(node.commit_index(), expected_commit);
        node.check_invariants();
    }
}

#[test]
fn figure_6_synchronizes() {
    synchronize_histories(&FIGURE_6, 3);
}

#[test]
fn figure_7_synchronizes() {
    synchronize_histories(&FIGURE_7, 8);
}

#[test]
fn figure_6_elections() {
    // Candidates 0 and 2 hold the most up-to-date logs and always win.
    for id in [0usize, 2] {
        let mut nodes = seeded_cluster(&FIGURE_6);
        start_election(&mut nodes[id]);
        drain(&mut nodes);
        assert!(nodes[id].is_leader());
    }
    // Candidates 1 and 3 can never win, no matter who answers.
    for id in [1usize, 3] {
        let mut nodes = seeded_cluster(&FIGURE_6);
        start_election(&mut nodes[id]);
        drain(&mut nodes);
        assert_eq!(nodes[id].role(), Role::Candidate);
    }
    // Candidate 4 wins with votes from 1 and 3...
    let mut nodes = seeded_cluster(&FIGURE_6);
    start_election(&mut nodes[4]);
    drain_with(&mut nodes, &[0, 2]);
    assert!(nodes[4].is_leader());
    // ...but not from 0 and 2, whose logs are ahead of its own.
    let mut nodes = seeded_cluster(&FIGURE_6);
    start_election(&mut nodes[4]);
    drain_with(&mut nodes, &[1, 3]);
    assert_eq!(nodes[4].role(), Role::Candidate);
}

#[test]
fn rejects_append_past_the_end_of_the_log() {
    // Figure 7 (a): nine entries; the leader probes one position past its
    // tail and must be refused.
    let mut nodes = seeded_cluster(&[FIGURE_7[1], &[], &[]]);
    let follower = &mut nodes[0];
    let env = Envelope {
        from: 1,
        to: 0,
        msg: Message::AppendEntries {
            term: 8,
            leader_id: 1,
            prev: Some(EntryId { index: 9, term: 6 }),
            entries: vec![LogEntry::new(8, cmd("x"))],
            leader_commit: None,
            round: 1,
        },
    };
    follower.step(Event::Receive(env)).unwrap();
    let outbox = follower.take_outbox();
    assert_eq!(outbox.len(), 1);
    match &outbox[0].msg {
        Message::AppendEntriesResponse {
            success,
            match_index,
            ..
        } => {
            assert!(!success);
            assert_eq!(*match_index, None);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(follower.log().len(), 9);
}

#[test]
fn vote_guard_compares_last_term_then_index() {
    // Candidate A's log ends at (term 3, index 5); B is one entry behind,
    // C has fewer entries but a later term.
    let mut nodes = seeded_cluster(&[
        &[1, 1, 2, 3, 3, 3],
        &[1, 1, 2, 3, 3],
        &[1, 4, 4],
    ]);
    start_election(&mut nodes[0]);
    let requests = nodes[0].take_outbox();
    for env in requests {
        let to = env.to as usize;
        nodes[to].step(Event::Receive(env)).unwrap();
    }

    let granted_by = |node: &mut TestNode| -> bool {
        let outbox = node.take_outbox();
        match &outbox[0].msg {
            Message::RequestVoteResponse { granted, .. } => *granted,
            other => panic!("unexpected reply: {:?}", other),
        }
    };
    // B: equal last term, shorter log: granted.
    assert!(granted_by(&mut nodes[1]));
    // C: later last term wins regardless of length: denied.
    assert!(!granted_by(&mut nodes[2]));
}

#[test]
fn higher_term_demotes_a_leader() {
    let mut nodes = blank_cluster(2);
    elect(&mut nodes, 0);
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);

    start_election(&mut nodes[1]);
    drain(&mut nodes);
    assert!(nodes[1].is_leader());
    assert_eq!(nodes[0].role(), Role::Follower);
    assert!(nodes[1].current_term() > 1);
}

#[test]
fn split_vote_resolves_on_retry() {
    let mut nodes = blank_cluster(2);
    // Both stand in the same term; each has already voted for itself.
    start_election(&mut nodes[0]);
    start_election(&mut nodes[1]);
    drain(&mut nodes);
    assert_eq!(nodes[0].role(), Role::Candidate);
    assert_eq!(nodes[1].role(), Role::Candidate);
    assert_eq!(nodes[0].current_term(), nodes[1].current_term());

    // One side times out first and carries the next term.
    start_election(&mut nodes[0]);
    drain(&mut nodes);
    assert!(nodes[0].is_leader());
    assert_eq!(nodes[1].role(), Role::Follower);
}

#[test]
fn heartbeats_suppress_elections() {
    let mut nodes = blank_cluster(3);
    elect(&mut nodes, 0);
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    let term = nodes[0].current_term();

    // The election timer keeps firing, but each interval saw a heartbeat.
    for _ in 0..5 {
        for id in 1..3 {
            nodes[id].step(Event::ElectionTimeout).unwrap();
            assert_eq!(nodes[id].role(), Role::Follower);
        }
        heartbeat(&mut nodes, 0);
        drain(&mut nodes);
    }
    assert!(nodes[0].is_leader());
    assert_eq!(nodes[0].current_term(), term);
}

/// Builds Figure 8 (c): five servers, entries from terms 1..=4 scattered
/// so that the term-2 entry sits on a majority without ever having been
/// committed.
fn set_up_figure_8() -> Vec<TestNode> {
    let mut nodes: Vec<TestNode> = (0..5)
        .map(|id| {
            booted_node(
                id,
                5,
                BootState {
                    current_term: 1,
                    ..BootState::default()
                },
            )
        })
        .collect();

    // s2 leads term 1 and commits x=1 everywhere.
    nodes[1].force_leader();
    nodes[1].client_append(cmd("x=1")).unwrap().unwrap();
    heartbeat(&mut nodes, 1);
    drain(&mut nodes);
    heartbeat(&mut nodes, 1);
    drain(&mut nodes);
    assert_eq!(commit_indexes(&nodes), vec![Some(0); 5]);

    // s1 wins term 2 and replicates x=2 to s2 only.
    start_election(&mut nodes[0]);
    drain(&mut nodes);
    assert!(nodes[0].is_leader());
    assert_eq!(nodes[0].current_term(), 2);
    nodes[0].client_append(cmd("x=2")).unwrap().unwrap();
    heartbeat(&mut nodes, 0);
    drain_with(&mut nodes, &[2, 3, 4]);
    assert_eq!(commit_indexes(&nodes), vec![Some(0); 5]);

    // s5 wins term 3 with votes from s3 and s4, and appends x=3 locally.
    start_election(&mut nodes[4]);
    drain_with(&mut nodes, &[0, 1]);
    assert!(nodes[4].is_leader());
    assert_eq!(nodes[4].current_term(), 3);
    nodes[4].client_append(cmd("x=3")).unwrap().unwrap();

    // s1 restarts; its first election fails because s3 already voted for
    // s5 in term 3 — voted_for must be durable for exactly this moment.
    restart_in_place(&mut nodes, 0);
    start_election(&mut nodes[0]);
    drain_with(&mut nodes, &[3, 4]);
    assert!(!nodes[0].is_leader());
    start_election(&mut nodes[0]);
    drain_with(&mut nodes, &[3, 4]);
    assert!(nodes[0].is_leader());
    assert_eq!(nodes[0].current_term(), 4);

    // Repair s2 and s3 up to the term-2 entry, then append x=4 locally.
    heartbeat(&mut nodes, 0);
    drain_with(&mut nodes, &[3, 4]);
    heartbeat(&mut nodes, 0);
    drain_with(&mut nodes, &[3, 4]);
    nodes[0].client_append(cmd("x=4")).unwrap().unwrap();

    // The term-2 entry now sits on s1, s2, s3 — a majority — yet nothing
    // past index 0 may be committed. The restarted s1 lost its volatile
    // commit index entirely and may not rebuild it by counting replicas
    // of the old entries.
    assert_eq!(
        commit_indexes(&nodes),
        vec![None, Some(0), Some(0), Some(0), Some(0)]
    );
    let logs: Vec<_> = nodes.iter().map(|n| n.log().entries().to_vec()).collect();
    assert_eq!(
        logs,
        vec![
            vec![entry(1, "x=1"), entry(2, "x=2"), entry(4, "x=4")],
            vec![entry(1, "x=1"), entry(2, "x=2")],
            vec![entry(1, "x=1"), entry(2, "x=2")],
            vec![entry(1, "x=1")],
            vec![entry(1, "x=1"), entry(3, "x=3")],
        ]
    );
    nodes
}

#[test]
fn figure_8_commit_waits_for_current_term_entry() {
    let mut nodes = set_up_figure_8();

    // Replicating the term-4 entry to s2 and s3 commits it — and with it,
    // implicitly, the term-2 entry below. The commit index jumps over both.
    heartbeat(&mut nodes, 0);
    drain_with(&mut nodes, &[3, 4]);
    heartbeat(&mut nodes, 0);
    drain_with(&mut nodes, &[3, 4]);
    // s1's commit index jumps straight from nothing to 2, covering the
    // term-2 entry it could not commit on its own.
    assert_eq!(
        commit_indexes(&nodes),
        vec![Some(2), Some(2), Some(2), Some(0), Some(0)]
    );
    let repaired = vec![entry(1, "x=1"), entry(2, "x=2"), entry(4, "x=4")];
    for node in &nodes[..3] {
        assert_eq!(node.log().entries(), &repaired[..]);
    }
}

#[test]
fn figure_8_uncommitted_majority_entry_may_be_overwritten() {
    let mut nodes = set_up_figure_8();

    // s5 restarts and needs two elections: s2 and s3 voted for s1 in
    // term 4, but nobody has voted in term 5 yet.
    restart_in_place(&mut nodes, 4);
    start_election(&mut nodes[4]);
    drain_with(&mut nodes, &[0]);
    assert!(!nodes[4].is_leader());
    start_election(&mut nodes[4]);
    drain_with(&mut nodes, &[0]);
    assert!(nodes[4].is_leader());
    assert_eq!(nodes[4].current_term(), 5);

    // Its term-3 entry now overwrites x=2 and x=4 everywhere — legal,
    // because neither was ever committed.
    heartbeat(&mut nodes, 4);
    drain(&mut nodes);
    let expected = vec![entry(1, "x=1"), entry(3, "x=3")];
    for node in &nodes {
        assert_eq!(node.log().entries(), &expected[..]);
        // Nothing past index 0 ever committed; the restarted nodes have
        // no commit index at all yet.
        assert!(node.commit_index() <= Some(0));
        node.check_invariants();
    }
}

#[test]
fn read_barrier_confirms_and_revokes() {
    let mut nodes = blank_cluster(3);
    elect(&mut nodes, 0);

    // A follower answers immediately: not the leader.
    let token = nodes[1].request_leader_confirm();
    assert_eq!(nodes[1].take_confirmations(), vec![(token, false)]);

    // The leader confirms only after a full post-call round is
    // acknowledged by a majority.
    let token = nodes[0].request_leader_confirm();
    assert!(nodes[0].take_confirmations().is_empty());
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    assert_eq!(nodes[0].take_confirmations(), vec![(token, true)]);

    // Losing the term fails the pending confirmation.
    let token = nodes[0].request_leader_confirm();
    let env = Envelope {
        from: 2,
        to: 0,
        msg: Message::RequestVote {
            term: nodes[0].current_term() + 1,
            candidate_id: 2,
            last: nodes[2].log().last(),
        },
    };
    nodes[0].step(Event::Receive(env)).unwrap();
    assert_eq!(nodes[0].take_confirmations(), vec![(token, false)]);
    assert_eq!(nodes[0].role(), Role::Follower);
}

#[test]
fn kv_store_applies_committed_entries_in_order() {
    let mut nodes = blank_cluster(3);
    let mut appliers: Vec<Applier> = (0..3).map(|_| Applier::new()).collect();
    let mut stores: Vec<KvStore> = (0..3).map(|_| KvStore::new()).collect();
    elect(&mut nodes, 0);

    let set = KvCommand::Set {
        key: "foo".into(),
        value: "bar".into(),
    };
    nodes[0].client_append(set.to_bytes()).unwrap().unwrap();
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);

    // The leader has committed and can apply; followers have not heard.
    assert_eq!(appliers[0].drain(&nodes[0], &mut stores[0]).len(), 1);
    assert_eq!(stores[0].get("foo"), Some("bar"));
    for id in 1..3 {
        assert!(appliers[id].drain(&nodes[id], &mut stores[id]).is_empty());
    }

    // The next round carries the commit index to the followers.
    heartbeat(&mut nodes, 0);
    drain(&mut nodes);
    for id in 1..3 {
        assert_eq!(appliers[id].drain(&nodes[id], &mut stores[id]).len(), 1);
        assert_eq!(stores[id].get("foo"), Some("bar"));
        assert_eq!(appliers[id].last_applied(), Some(0));
    }
    // Replays apply nothing further.
    assert!(appliers[0].drain(&nodes[0], &mut stores[0]).is_empty());
}
