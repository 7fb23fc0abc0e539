//! The deployable runtime: real sockets and wall-clock timers driving the
//! same consensus core the simulator exercises.

pub mod client;
pub mod server;
pub mod udp;

use serde::{Deserialize, Serialize};

use crate::raft::message::{Envelope, NodeId};

/// Everything that travels in a datagram: consensus traffic between
/// servers, or the client protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datagram {
    Raft(Envelope),
    Request { id: u64, command: ClientRequest },
    Reply { id: u64, reply: ClientReply },
}

impl Datagram {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("datagram serialization should not fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Client-facing commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Set { key: String, value: String },
    Delete { key: String },
    Get { key: String },
}

/// Client-facing outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    /// Write accepted and committed at this log index.
    Committed { index: u64 },
    /// Read served under a confirmed leadership.
    Value { value: Option<String> },
    /// Try elsewhere; `hint` is the responder's best guess at the leader.
    NotLeader { hint: Option<NodeId> },
}
