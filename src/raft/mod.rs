pub mod config;
pub mod log;
pub mod message;
pub mod network;
pub mod node;
pub mod progress;

#[cfg(test)]
mod tests;

pub use config::ClusterConfig;
pub use log::{EntryId, Log, LogEntry};
pub use message::{Envelope, Message, NodeId};
pub use network::{InMemoryNetwork, NetworkOptions};
pub use node::{ConfirmToken, Event, NotLeader, RaftNode, Receipt, Role};
pub use progress::{PeerSet, Progress, MAX_CLUSTER_SIZE};
