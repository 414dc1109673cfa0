//! In-memory log of replicated entries.
//!
//! Entries are addressed by absolute, 1-based index even after a prefix has
//! been compacted into a snapshot. Payloads are views into reference-counted
//! buffers so that a decoded wire batch shares a single allocation across all
//! of its entries; the allocation is released when the last view is dropped.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Command,
    Configuration,
}

/// View into a reference-counted payload buffer.
#[derive(Clone)]
pub struct EntryBuf {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl EntryBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            data: bytes.into(),
            offset: 0,
            len,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// View of `len` bytes at `offset` inside a shared batch buffer.
    pub fn slice(batch: &Arc<[u8]>, offset: usize, len: usize) -> Self {
        assert!(offset + len <= batch.len());
        Self {
            data: Arc::clone(batch),
            offset,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both views share the same backing allocation.
    pub fn shares_backing(&self, other: &EntryBuf) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for EntryBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryBuf").field("len", &self.len).finish()
    }
}

impl PartialEq for EntryBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for EntryBuf {}

/// A single log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: EntryBuf,
}

impl Entry {
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: EntryBuf) -> Self {
        Self {
            index,
            term,
            kind,
            payload,
        }
    }

    pub fn command(index: u64, term: u64, payload: Vec<u8>) -> Self {
        Self::new(index, term, EntryKind::Command, EntryBuf::new(payload))
    }

    /// Empty command appended by a new leader to force commit of prior-term
    /// entries.
    pub fn noop(index: u64, term: u64) -> Self {
        Self::new(index, term, EntryKind::Command, EntryBuf::empty())
    }
}

/// Result of a term lookup by absolute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermOf {
    Term(u64),
    /// The index was compacted into a snapshot; callers fall back to the
    /// snapshot's last included term.
    Compacted,
    /// The index lies beyond the last entry.
    Missing,
}

/// Append-only log with suffix truncation and post-snapshot prefix
/// compaction.
#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<Entry>,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_last_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_last_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.term)
            .unwrap_or(self.snapshot_last_term)
    }

    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.snapshot_last_term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_last_index || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot_last_index - 1) as usize)
    }

    pub fn get(&self, index: u64) -> Result<&Entry, LogError> {
        if index == 0 || index > self.last_index() {
            return Err(LogError::IndexOutOfRange {
                index,
                last: self.last_index(),
            });
        }
        if index <= self.snapshot_last_index {
            return Err(LogError::IndexCompacted { index });
        }
        Ok(&self.entries[self.slot(index).unwrap()])
    }

    pub fn term_of(&self, index: u64) -> TermOf {
        if index == 0 {
            return TermOf::Term(0);
        }
        if index == self.snapshot_last_index {
            return TermOf::Term(self.snapshot_last_term);
        }
        if index < self.snapshot_last_index {
            return TermOf::Compacted;
        }
        match self.slot(index) {
            Some(slot) => TermOf::Term(self.entries[slot].term),
            None => TermOf::Missing,
        }
    }

    /// Appends a new entry and returns its assigned index.
    pub fn append(&mut self, term: u64, kind: EntryKind, payload: EntryBuf) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(Entry::new(index, term, kind, payload));
        index
    }

    /// Appends pre-indexed entries, validating that indices continue the log
    /// without gaps.
    pub fn append_batch(&mut self, entries: Vec<Entry>) -> Result<(), LogError> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(LogError::NonSequentialAppend {
                    expected,
                    attempted: entry.index,
                });
            }
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Drops every entry at `from_index` and above, returning them. Callers
    /// must only truncate uncommitted suffixes.
    pub fn truncate_suffix(&mut self, from_index: u64) -> Result<Vec<Entry>, LogError> {
        if from_index <= self.snapshot_last_index {
            return Err(LogError::IndexCompacted { index: from_index });
        }
        if from_index > self.last_index() {
            return Ok(Vec::new());
        }
        let slot = self.slot(from_index).unwrap();
        Ok(self.entries.split_off(slot))
    }

    /// Compacts every entry up to and including `up_to_index` after a
    /// snapshot covering that prefix was taken.
    pub fn truncate_prefix(&mut self, up_to_index: u64) -> Result<(), LogError> {
        if up_to_index <= self.snapshot_last_index {
            return Ok(());
        }
        if up_to_index > self.last_index() {
            return Err(LogError::IndexOutOfRange {
                index: up_to_index,
                last: self.last_index(),
            });
        }
        let keep = self.slot(up_to_index).unwrap() + 1;
        let term = self.entries[keep - 1].term;
        self.entries.drain(..keep);
        self.snapshot_last_index = up_to_index;
        self.snapshot_last_term = term;
        Ok(())
    }

    /// Replaces the whole log with the markers of an installed snapshot.
    pub fn reset(&mut self, snapshot_last_index: u64, snapshot_last_term: u64) {
        self.entries.clear();
        self.snapshot_last_index = snapshot_last_index;
        self.snapshot_last_term = snapshot_last_term;
    }

    /// Clones up to `max` entries starting at `from_index`.
    pub fn entries_from(&self, from_index: u64, max: usize) -> Result<Vec<Entry>, LogError> {
        if from_index <= self.snapshot_last_index {
            return Err(LogError::IndexCompacted { index: from_index });
        }
        if from_index > self.last_index() {
            return Ok(Vec::new());
        }
        let slot = self.slot(from_index).unwrap();
        let end = (slot + max).min(self.entries.len());
        Ok(self.entries[slot..end].to_vec())
    }

    /// Newest configuration entry at or below `below`, if any survives in the
    /// uncompacted part of the log.
    pub fn newest_configuration_at_or_below(&self, below: u64) -> Option<&Entry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.index <= below)
            .find(|entry| entry.kind == EntryKind::Configuration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("index {index} is out of range (last index {last})")]
    IndexOutOfRange { index: u64, last: u64 },

    #[error("index {index} was compacted into a snapshot")]
    IndexCompacted { index: u64 },

    #[error("expected next index {expected}, attempted {attempted}")]
    NonSequentialAppend { expected: u64, attempted: u64 },
}
