use serde::{Deserialize, Serialize};

/// A single replicated log entry: the term it was created in and an opaque
/// command for the application state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that created this entry.
    pub term: u64,
    /// Opaque command bytes; the consensus core never inspects them.
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        LogEntry { term, command }
    }
}

/// Position of an entry in a log: index plus the term recorded there.
///
/// `Option<EntryId>` is used wherever the protocol needs "the entry before
/// the log begins": `None` is the position preceding index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryId {
    pub index: u64,
    pub term: u64,
}

/// What an accepted `append_entries` call actually did to the log.
///
/// The storage layer mirrors the in-memory log into its file without
/// diffing: a truncation forces a rewrite, a plain append only writes the
/// new suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// A conflicting suffix was discarded before appending.
    pub truncated: bool,
    /// Index of the first entry written by this call, if any were.
    pub appended_from: Option<u64>,
}

/// The replicated log: a contiguous, 0-indexed sequence of entries.
///
/// Invariants:
/// - No holes: entries occupy indices `0..len` contiguously (by construction).
/// - Term monotonicity: `self[i].term <= self[j].term` for `i < j`.
/// - Match property: two logs sharing an `(index, term)` pair agree on every
///   entry at and before that index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new() }
    }

    /// Rebuild a log from recovered entries (e.g. a WAL scan).
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let log = Log { entries };
        assert!(log.terms_monotonic(), "recovered log has non-monotonic terms");
        log
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Identity of the last entry, or `None` for an empty log.
    pub fn last(&self) -> Option<EntryId> {
        self.entries.last().map(|e| EntryId {
            index: self.len() - 1,
            term: e.term,
        })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// All entries at and after `index` (empty if `index >= len`).
    pub fn tail_from(&self, index: u64) -> &[LogEntry] {
        let start = (index as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Whether terms are non-decreasing across the whole log.
    pub fn terms_monotonic(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].term <= w[1].term)
    }

    /// The AppendEntries receiver rule.
    ///
    /// `prev` names the entry immediately before the incoming batch
    /// (`None` = batch starts at index 0). Returns `None` if the continuity
    /// check fails, leaving the log untouched; otherwise applies the batch
    /// and reports what changed.
    ///
    /// Conflict handling: an existing entry whose term differs from the
    /// incoming entry at the same index causes truncation from that index.
    /// An existing entry with the same term is skipped without truncation,
    /// so replaying a delayed or duplicated message can never erase a
    /// suffix that is already in place. An empty batch is a pure
    /// continuity probe.
    pub fn append_entries(
        &mut self,
        prev: Option<EntryId>,
        entries: &[LogEntry],
    ) -> Option<AppendOutcome> {
        if let Some(prev) = prev {
            match self.term_at(prev.index) {
                Some(term) if term == prev.term => {}
                // Missing entry (hole) or mismatched previous term.
                _ => return None,
            }
        }

        // The batch itself must keep terms non-decreasing, starting from
        // the previous entry's term.
        let mut floor = prev.map(|p| p.term).unwrap_or(0);
        for entry in entries {
            if entry.term < floor {
                return None;
            }
            floor = entry.term;
        }

        let base = prev.map(|p| p.index + 1).unwrap_or(0);
        let mut truncated = false;
        let mut appended_from = None;

        for (k, entry) in entries.iter().enumerate() {
            let dst = base + k as u64;
            if dst < self.len() {
                if self.entries[dst as usize].term == entry.term {
                    // Already present; by the match property it is the same
                    // entry.
                    debug_assert_eq!(self.entries[dst as usize].command, entry.command);
                    continue;
                }
                self.entries.truncate(dst as usize);
                truncated = true;
            }
            if appended_from.is_none() {
                appended_from = Some(self.len());
            }
            self.entries.push(entry.clone());
        }

        debug_assert!(self.terms_monotonic());
        Some(AppendOutcome {
            truncated,
            appended_from,
        })
    }
}
