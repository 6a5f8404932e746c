//! The in-memory replicated log.
//!
//! Entries are held in a plain `Vec`, indexed from zero. The log never
//! reorders entries; its tail can only be discarded by the AppendEntries
//! conflict-truncation rule in `server::handlers`.

use crate::common::RaftError;

/// A single entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub index: usize,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Contract a replicated log must satisfy. `MemoryLog` is the only
/// implementation this crate ships; the trait exists so tests can swap in
/// logs pre-seeded with specific conflict scenarios (see `mocks`).
pub trait Log: Send {
    /// Number of entries currently in the log.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry at `index`, if any.
    fn get_entry(&self, index: usize) -> Option<&Entry>;

    /// All entries from `index` (inclusive) to the end of the log.
    fn get_entries_from(&self, index: usize) -> &[Entry];

    /// Index of the last entry in the log, if any.
    fn last_index(&self) -> Option<usize> {
        self.len().checked_sub(1)
    }

    /// Term of the last entry in the log, or 0 if the log is empty.
    fn last_term(&self) -> u64 {
        self.len()
            .checked_sub(1)
            .and_then(|i| self.get_entry(i))
            .map(|e| e.term)
            .unwrap_or(0)
    }

    /// Appends a new entry built from `term` and `command`, returning its index.
    fn append_command(&mut self, term: u64, command: Vec<u8>) -> usize;

    /// Truncates the log to `len` entries, then appends `entries`.
    /// Used by the AppendEntries handler's conflict-resolution rule.
    fn truncate_and_append(&mut self, truncate_to: usize, entries: Vec<Entry>) -> Result<(), RaftError>;

    /// True iff a candidate whose log ends at `(candidate_last_index,
    /// candidate_last_term)` is at least as up to date as this log, per the
    /// RequestVote up-to-date check.
    fn is_candidate_log_up_to_date(&self, candidate_last_index: Option<usize>, candidate_last_term: u64) -> bool {
        let my_last_term = self.last_term();
        if candidate_last_term != my_last_term {
            return candidate_last_term > my_last_term;
        }
        candidate_last_index.unwrap_or(0) >= self.last_index().unwrap_or(0) || self.is_empty()
    }
}

/// A plain `Vec`-backed log. The base index is always 0: this core never
/// snapshots, so there is no need to track a non-zero logical base.
#[derive(Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
}

impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog { entries: Vec::new() }
    }

    /// Seeds the log with pre-built entries, for tests that need to start
    /// from a specific log shape.
    pub fn from_entries(entries: Vec<Entry>) -> MemoryLog {
        MemoryLog { entries }
    }
}

impl Log for MemoryLog {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get_entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    fn get_entries_from(&self, index: usize) -> &[Entry] {
        if index >= self.entries.len() {
            &[]
        } else {
            &self.entries[index..]
        }
    }

    fn append_command(&mut self, term: u64, command: Vec<u8>) -> usize {
        let index = self.entries.len();
        self.entries.push(Entry { index, term, command });
        index
    }

    fn truncate_and_append(&mut self, truncate_to: usize, entries: Vec<Entry>) -> Result<(), RaftError> {
        if truncate_to < self.entries.len() {
            self.entries.truncate(truncate_to);
        }
        self.entries.extend(entries);
        Ok(())
    }
}

/// Mock log builders used by server/peer/handler tests.
#[cfg(test)]
pub mod mocks {
    use super::{Entry, MemoryLog};

    pub fn random_entry_with_term(term: u64) -> Entry {
        Entry {
            index: 0,
            term,
            command: vec![1, 2, 3],
        }
    }

    pub fn random_entries_with_term(count: usize, term: u64) -> Vec<Entry> {
        (0..count)
            .map(|i| Entry {
                index: i,
                term,
                command: vec![i as u8],
            })
            .collect()
    }

    pub fn new_mock_log() -> MemoryLog {
        MemoryLog::new()
    }

    pub fn new_random_with_term(size: usize, term: u64) -> MemoryLog {
        MemoryLog::from_entries(random_entries_with_term(size, term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_command_assigns_increasing_indices() {
        let mut log = MemoryLog::new();
        assert_eq!(log.append_command(1, vec![0]), 0);
        assert_eq!(log.append_command(1, vec![1]), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn truncate_and_append_discards_conflicting_suffix() {
        let mut log = MemoryLog::from_entries(vec![
            Entry { index: 0, term: 1, command: vec![b'x'] },
            Entry { index: 1, term: 1, command: vec![b'y'] },
            Entry { index: 2, term: 2, command: vec![b'z'] },
        ]);
        log.truncate_and_append(2, vec![Entry { index: 2, term: 3, command: vec![b'w'] }]).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.get_entry(2).unwrap().term, 3);
        assert_eq!(log.get_entry(2).unwrap().command, vec![b'w']);
    }

    #[test]
    fn empty_log_reports_last_term_zero() {
        let log = MemoryLog::new();
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.last_index(), None);
    }

    #[test]
    fn up_to_date_check_prefers_higher_term() {
        let log = MemoryLog::from_entries(vec![Entry { index: 0, term: 2, command: vec![] }]);
        assert!(log.is_candidate_log_up_to_date(Some(0), 3));
        assert!(!log.is_candidate_log_up_to_date(Some(5), 1));
    }
}
