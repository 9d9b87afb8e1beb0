//! In-memory replicated log with snapshot-based compaction.
//!
//! Indices are 1-based; index 0 is the imaginary entry before the log, whose
//! term is 0. After compaction the prefix up to `snapshot_index` lives only
//! in the snapshot and the log holds `snapshot_index + 1 ..= last_index`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPayload {
    /// Barrier entry a new leader appends to commit its term.
    Noop,
    /// An opaque state-machine command (serialized `Command`).
    Command(serde_json::Value),
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// The log proper.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts.
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        Self {
            entries: entries.into(),
            snapshot_index,
            snapshot_term,
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`, if it is still known.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index - self.snapshot_index - 1) as usize;
        self.entries.get(offset)
    }

    /// Clone entries from `from` (inclusive) onward, at most `limit`.
    pub fn entries_from(&self, from: u64, limit: usize) -> Vec<LogEntry> {
        let start = from.max(self.snapshot_index + 1);
        (start..=self.last_index())
            .take(limit)
            .filter_map(|i| self.get(i).cloned())
            .collect()
    }

    /// Whether the log contains `prev_index` with `prev_term` (the
    /// AppendEntries consistency check).
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push_back(entry);
    }

    /// Drop every entry at `from` and beyond (conflict truncation).
    pub fn truncate_from(&mut self, from: u64) {
        while self
            .entries
            .back()
            .map(|e| e.index >= from)
            .unwrap_or(false)
        {
            self.entries.pop_back();
        }
    }

    /// Drop every entry up to and including `through`; the snapshot now
    /// covers that prefix.
    pub fn compact_to(&mut self, through: u64, term: u64) {
        while self
            .entries
            .front()
            .map(|e| e.index <= through)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.snapshot_index = through;
        self.snapshot_term = term;
    }

    /// Replace everything; used when installing a snapshot ahead of the log.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Number of entries held in memory (not counting the snapshot prefix).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All in-memory entries, for persistence rewrites.
    pub fn all_entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}
