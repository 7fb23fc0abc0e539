//! Durable server state: the vote manifest and the log file.
//!
//! The consensus core calls through the [`Storage`] trait at the protocol
//! points that require durability before a reply. A write failure is fatal
//! (the server must halt rather than acknowledge state it cannot honor
//! after a restart); errors therefore propagate out of the event step
//! untouched.

pub mod manifest;
pub mod wal;

use std::io;
use std::path::Path;

use crate::raft::log::LogEntry;
use crate::raft::message::NodeId;

pub use manifest::{HardState, VoteManifest};
pub use wal::{RecoveryOutcome, Wal};

/// State recovered from (or seeded into) storage at boot.
#[derive(Debug, Clone, Default)]
pub struct BootState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
}

/// Durability hooks invoked by the consensus core.
///
/// Every method must complete before the corresponding RPC response goes
/// out; the core treats the call as part of its atomic event step.
pub trait Storage {
    /// Persist `(current_term, voted_for)`.
    fn persist_vote(&mut self, current_term: u64, voted_for: Option<NodeId>) -> io::Result<()>;

    /// Persist newly appended entries starting at log index `from_index`.
    fn persist_append(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()>;

    /// Persist the whole log after a conflicting suffix was truncated.
    fn persist_rewrite(&mut self, entries: &[LogEntry]) -> io::Result<()>;
}

/// In-memory storage for tests and the simulator.
///
/// It records exactly what was persisted, so a simulated crash-restart
/// (rebuilding the node from [`MemoryStorage::boot_state`]) loses volatile
/// state but keeps the hard state — the same contract as [`FileStorage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    current_term: u64,
    voted_for: Option<NodeId>,
    entries: Vec<LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Storage already holding `boot`, for nodes constructed mid-history.
    /// The node's in-memory log and its storage must agree at boot.
    pub fn from_boot(boot: &BootState) -> Self {
        MemoryStorage {
            current_term: boot.current_term,
            voted_for: boot.voted_for,
            entries: boot.entries.clone(),
        }
    }

    pub fn boot_state(&self) -> BootState {
        BootState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            entries: self.entries.clone(),
        }
    }
}

impl Storage for MemoryStorage {
    fn persist_vote(&mut self, current_term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        self.current_term = current_term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn persist_append(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()> {
        debug_assert_eq!(from_index, self.entries.len() as u64);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn persist_rewrite(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.entries = entries.to_vec();
        Ok(())
    }
}

/// File-backed storage: one manifest plus one log file in a data directory.
#[derive(Debug)]
pub struct FileStorage {
    manifest: VoteManifest,
    wal: Wal,
}

impl FileStorage {
    /// Open the data directory, creating it if needed, and recover the
    /// persisted state.
    pub fn open(dir: &Path) -> io::Result<(Self, BootState)> {
        std::fs::create_dir_all(dir)?;
        let manifest = VoteManifest::open(&dir.join("vote.manifest"))?;
        let (wal, entries, outcome) = Wal::open(&dir.join("log.wal"))?;
        match outcome {
            RecoveryOutcome::Clean { entries } => {
                log::info!("storage: recovered {} log entries", entries);
            }
            RecoveryOutcome::Truncated {
                entries,
                dropped_bytes,
            } => {
                log::warn!(
                    "storage: recovered {} log entries, dropped {} torn bytes",
                    entries,
                    dropped_bytes
                );
            }
        }
        let hard = manifest.state();
        let boot = BootState {
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            entries,
        };
        Ok((FileStorage { manifest, wal }, boot))
    }
}

impl Storage for FileStorage {
    fn persist_vote(&mut self, current_term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        self.manifest.set(current_term, voted_for)
    }

    fn persist_append(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()> {
        self.wal.append(from_index, entries)
    }

    fn persist_rewrite(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.wal.rewrite(entries)
    }
}
