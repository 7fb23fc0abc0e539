//! Application binding: feeding committed entries to a state machine.
//!
//! The consensus core only promises a monotonic `commit_index`. The
//! [`Applier`] turns that into exactly-once, in-order `apply` calls, and
//! [`KvStore`] is the reference application.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::raft::node::RaftNode;
use crate::store::Storage;

/// A deterministic state machine driven by committed log entries.
///
/// `apply` must be pure state transformation: no I/O, no clocks, no
/// randomness. Identical logs replayed on two servers must produce
/// identical states and responses.
pub trait Application {
    /// Apply the committed command at `index`, returning the response
    /// bytes for whoever is waiting on that index.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;
}

/// Tracks `last_applied` and drains newly committed entries in order.
#[derive(Debug, Default)]
pub struct Applier {
    last_applied: Option<u64>,
}

impl Applier {
    pub fn new() -> Self {
        Applier::default()
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Apply everything newly committed, exactly once per index, in log
    /// order. Returns `(index, response)` per applied entry.
    pub fn drain<S: Storage, A: Application>(
        &mut self,
        node: &RaftNode<S>,
        app: &mut A,
    ) -> Vec<(u64, Vec<u8>)> {
        let mut applied = Vec::new();
        while self.last_applied < node.commit_index() {
            let next = self.last_applied.map_or(0, |i| i + 1);
            let entry = node
                .log()
                .get(next)
                .expect("committed entries exist in the log");
            applied.push((next, app.apply(next, &entry.command)));
            self.last_applied = Some(next);
        }
        applied
    }
}

/// Commands accepted by the key-value store, bincode-encoded into log
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("kv command serialization should not fail")
    }
}

/// Outcome of applying one [`KvCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvReply {
    /// Set succeeded; carries the value that was replaced, if any.
    Stored { previous: Option<String> },
    /// Delete result: whether the key existed.
    Removed { existed: bool },
    /// The command bytes did not decode. Deterministic, like every other
    /// outcome: the same bad bytes fail the same way everywhere.
    Malformed,
}

impl KvReply {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// The reference application: a replicated map of strings.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    /// Read a key from applied state. Linearizable only behind a
    /// leadership confirmation.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Application for KvStore {
    fn apply(&mut self, _index: u64, command: &[u8]) -> Vec<u8> {
        let reply = match bincode::deserialize::<KvCommand>(command) {
            Ok(KvCommand::Set { key, value }) => KvReply::Stored {
                previous: self.data.insert(key, value),
            },
            Ok(KvCommand::Delete { key }) => KvReply::Removed {
                existed: self.data.remove(&key).is_some(),
            },
            Err(_) => KvReply::Malformed,
        };
        bincode::serialize(&reply).expect("kv reply serialization should not fail")
    }
}
