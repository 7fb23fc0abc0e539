//! Cluster-wide safety checker.
//!
//! Runs after every simulated event step and holds the whole run's
//! history: which node led each term, what has ever been observed
//! committed, and what each state machine applied. Per-node structural
//! invariants are asserted by the nodes themselves; everything here is a
//! cross-node property.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::raft::log::LogEntry;
use crate::raft::message::NodeId;
use crate::raft::node::RaftNode;
use crate::store::MemoryStorage;

/// A safety violation. Any of these is a bug in the consensus core, never
/// a legal execution.
#[derive(Debug, Clone)]
pub enum Violation {
    /// Two servers won the same term.
    TwoLeaders { term: u64, first: NodeId, second: NodeId },
    /// Two servers committed different entries at the same index.
    CommittedDiverged {
        index: u64,
        node: NodeId,
    },
    /// A leader's log is missing an entry committed at or below its term.
    LeaderIncomplete {
        leader: NodeId,
        term: u64,
        index: u64,
    },
    /// Two state machines applied different commands at the same index.
    AppliedDiverged { node: NodeId, index: u64 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::TwoLeaders { term, first, second } => {
                write!(
                    f,
                    "two leaders in term {}: node {} and node {}",
                    term, first, second
                )
            }
            Violation::CommittedDiverged { index, node } => {
                write!(
                    f,
                    "node {} committed a different entry at index {}",
                    node, index
                )
            }
            Violation::LeaderIncomplete { leader, term, index } => {
                write!(
                    f,
                    "leader {} of term {} is missing committed entry {}",
                    leader, term, index
                )
            }
            Violation::AppliedDiverged { node, index } => {
                write!(
                    f,
                    "node {} applied a different command at index {}",
                    node, index
                )
            }
        }
    }
}

/// An entry the checker has seen committed, and the lowest term any
/// observer held when committing it.
#[derive(Debug, Clone)]
struct CommittedRecord {
    entry: LogEntry,
    commit_term: u64,
}

#[derive(Debug, Default)]
pub struct Checker {
    /// Winner of every term that ever produced a leader.
    leaders_by_term: HashMap<u64, NodeId>,
    /// Everything ever observed committed, by index.
    committed: BTreeMap<u64, CommittedRecord>,
    /// First-applied command per index; replays must match.
    applied: BTreeMap<u64, Vec<u8>>,
}

impl Checker {
    pub fn new() -> Self {
        Checker::default()
    }

    /// Number of distinct indices ever observed committed.
    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// Terms that produced a leader, in order.
    pub fn leader_terms(&self) -> Vec<u64> {
        let mut terms: Vec<u64> = self.leaders_by_term.keys().copied().collect();
        terms.sort_unstable();
        terms
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    /// Check every cross-node safety property against the current state.
    pub fn check(&mut self, nodes: &[Option<RaftNode<MemoryStorage>>]) -> Result<(), Violation> {
        for node in nodes.iter().flatten() {
            node.check_invariants();

            // Election safety: at most one leader per term, ever.
            if node.is_leader() {
                let term = node.current_term();
                match self.leaders_by_term.get(&term) {
                    Some(&winner) if winner != node.id() => {
                        return Err(Violation::TwoLeaders {
                            term,
                            first: winner,
                            second: node.id(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        self.leaders_by_term.insert(term, node.id());
                    }
                }
            }

            // Committed prefixes must agree across the whole run.
            if let Some(commit) = node.commit_index() {
                for index in 0..=commit {
                    let entry = node
                        .log()
                        .get(index)
                        .expect("committed entries exist in the log");
                    match self.committed.get_mut(&index) {
                        Some(record) => {
                            if record.entry != *entry {
                                return Err(Violation::CommittedDiverged {
                                    index,
                                    node: node.id(),
                                });
                            }
                            record.commit_term = record.commit_term.min(node.current_term());
                        }
                        None => {
                            self.committed.insert(
                                index,
                                CommittedRecord {
                                    entry: entry.clone(),
                                    commit_term: node.current_term(),
                                },
                            );
                        }
                    }
                }
            }
        }

        // Leader completeness: a leader must hold every entry committed at
        // or below its own term. (A deposed leader stuck in an older term
        // is exempt; it can never commit anything again.)
        for node in nodes.iter().flatten() {
            if !node.is_leader() {
                continue;
            }
            for (&index, record) in &self.committed {
                if node.current_term() < record.commit_term {
                    continue;
                }
                if node.log().get(index) != Some(&record.entry) {
                    return Err(Violation::LeaderIncomplete {
                        leader: node.id(),
                        term: node.current_term(),
                        index,
                    });
                }
            }
        }

        Ok(())
    }

    /// State-machine safety: the first application of an index fixes its
    /// command; every replay (including after a crash-rebuild) must match.
    pub fn record_applied(
        &mut self,
        node: NodeId,
        index: u64,
        command: Vec<u8>,
    ) -> Result<(), Violation> {
        match self.applied.get(&index) {
            Some(first) if *first != command => Err(Violation::AppliedDiverged { node, index }),
            Some(_) => Ok(()),
            None => {
                self.applied.insert(index, command);
                Ok(())
            }
        }
    }
}
