// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sparse offset index.
//!
//! One entry per stride rather than per record. A lookup lands on the nearest
//! indexed record at or before the target and the caller scans forward from
//! there, so seek cost is O(log entries + stride).
//!
//! ```text
//! entries: (1, 0) (65, 4160) (129, 8320)
//! lookup(100) -> 4160   scan 65..=100
//! lookup(0)   -> 0      segment start
//! ```

use eventsource_persistence::idx::IndexEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseIndex {
    entries: Vec<IndexEntry>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries already validated as strictly increasing.
    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        debug_assert!(entries
            .windows(2)
            .all(|w| w[0].offset < w[1].offset && w[0].position < w[1].position));
        Self { entries }
    }

    /// Record an entry. Returns false, leaving the index untouched, if the entry
    /// does not strictly follow the last one in both fields.
    pub fn record(&mut self, offset: u64, position: u64) -> bool {
        if let Some(last) = self.entries.last() {
            if offset <= last.offset || position <= last.position {
                return false;
            }
        }
        self.entries.push(IndexEntry { offset, position });
        true
    }

    /// Byte position of the largest indexed offset <= `target`, or 0.
    pub fn lookup(&self, target: u64) -> u64 {
        self.floor(target).map_or(0, |e| e.position)
    }

    pub fn floor(&self, target: u64) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.offset <= target);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// Drop every entry at or beyond `position`.
    pub fn truncate_from(&mut self, position: u64) {
        let keep = self.entries.partition_point(|e| e.position < position);
        self.entries.truncate(keep);
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// When an index entry is due: every `records` records or `bytes` bytes since
/// the last entry, whichever comes first. The first record of a segment is
/// always indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStride {
    pub records: u32,
    pub bytes: u64,
}

impl IndexStride {
    pub fn new(records: u32, bytes: u64) -> Self {
        Self { records, bytes }
    }
}

/// Progress since the last index entry of a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrideState {
    indexed_any: bool,
    records_since: u64,
    bytes_since: u64,
}

impl StrideState {
    pub fn is_due(&self, stride: &IndexStride) -> bool {
        !self.indexed_any
            || self.records_since >= u64::from(stride.records)
            || self.bytes_since >= stride.bytes
    }

    /// Account for one appended frame. `indexed` is whether it got an entry.
    pub fn advance(&mut self, frame_len: u64, indexed: bool) {
        if indexed {
            self.indexed_any = true;
            self.records_since = 0;
            self.bytes_since = 0;
        }
        self.records_since += 1;
        self.bytes_since += frame_len;
    }
}
