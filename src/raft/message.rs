use serde::{Deserialize, Serialize};

use super::log::{EntryId, LogEntry};

/// Identifier of a server: its position in the configured address list.
pub type NodeId = u32;

/// Raft protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Vote solicitation broadcast by a candidate at the start of an
    /// election.
    RequestVote {
        /// Candidate's term.
        term: u64,
        /// Candidate requesting the vote.
        candidate_id: NodeId,
        /// Identity of the candidate's last log entry (`None` = empty log).
        /// Used by the receiver for the up-to-date check.
        last: Option<EntryId>,
    },

    /// Vote reply.
    RequestVoteResponse {
        /// Voter's current term.
        term: u64,
        /// Node that cast (or refused) the vote.
        voter_id: NodeId,
        granted: bool,
    },

    /// Log replication / heartbeat, sent by the leader.
    ///
    /// An empty `entries` batch is a heartbeat: it still carries the
    /// continuity check and the leader's commit index.
    AppendEntries {
        /// Leader's term.
        term: u64,
        leader_id: NodeId,
        /// Entry immediately preceding `entries` (`None` = start of log).
        prev: Option<EntryId>,
        entries: Vec<LogEntry>,
        /// Leader's commit index. `None` means nothing committed yet;
        /// receivers must not advance their commit index past it.
        leader_commit: Option<u64>,
        /// Heartbeat round counter, echoed in the response. Leadership
        /// confirmation fires only once a majority has acknowledged a
        /// round at or beyond the caller's barrier.
        round: u64,
    },

    /// Reply to AppendEntries.
    AppendEntriesResponse {
        /// Responder's current term.
        term: u64,
        from: NodeId,
        success: bool,
        /// On success, the highest index now known replicated on the
        /// responder. `None` on failure (or an empty log prefix).
        match_index: Option<u64>,
        /// Round counter copied from the request.
        round: u64,
    },
}

impl Message {
    /// The term this message was produced under.
    pub fn term(&self) -> u64 {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. } => *term,
        }
    }

}

/// A routed message: the transport unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub msg: Message,
}

impl Envelope {
    /// Serialize for the wire using bincode.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("envelope serialization should not fail")
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
