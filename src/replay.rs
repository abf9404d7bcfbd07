// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Lazy, bounded replay across segments.

use crate::error::{LogError, LogResult};
use crate::segment::{Segment, SegmentCursor};
use eventsource_persistence::{PersistenceError, Record};
use std::sync::Arc;

/// Iterator over committed records in offset order.
///
/// The upper bound is the high-water mark at creation, so the range is finite
/// even while appends continue. After an error the iterator is exhausted; a
/// caller restarts from [`ReadRange::next_offset`].
pub struct ReadRange {
    segments: Vec<Arc<Segment>>,
    current: usize,
    cursor: Option<SegmentCursor>,
    next_offset: u64,
    end: u64,
    remaining: usize,
    failed: bool,
}

impl ReadRange {
    pub(crate) fn new(segments: Vec<Arc<Segment>>, start: u64, end: u64, max_records: usize) -> Self {
        Self {
            segments,
            current: 0,
            cursor: None,
            next_offset: start,
            end,
            remaining: max_records,
            failed: false,
        }
    }

    pub(crate) fn empty(start: u64) -> Self {
        Self::new(Vec::new(), start, start, 0)
    }

    /// Offset the next call to `next` would yield, and where to resume from.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    fn advance(&mut self) -> LogResult<Option<Record>> {
        loop {
            if self.cursor.is_none() {
                let Some(segment) = self.segments.get(self.current) else {
                    return Ok(None);
                };
                if segment.next_offset() <= self.next_offset {
                    self.current += 1;
                    continue;
                }
                self.cursor = Some(segment.cursor_from(self.next_offset)?);
            }

            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };
            let position = cursor.position();
            match cursor.next_record()? {
                Some(record) if record.offset == self.next_offset => return Ok(Some(record)),
                Some(record) => {
                    return Err(LogError::CorruptFrame {
                        segment: self.segments[self.current].base_offset(),
                        position,
                        source: PersistenceError::InvalidFormat(format!(
                            "expected offset {}, found {}",
                            self.next_offset, record.offset
                        )),
                    })
                }
                None => {
                    self.cursor = None;
                    self.current += 1;
                }
            }
        }
    }
}

impl Iterator for ReadRange {
    type Item = LogResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 || self.next_offset >= self.end {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => {
                self.next_offset = record.offset + 1;
                self.remaining -= 1;
                Some(Ok(record))
            }
            Ok(None) => {
                self.remaining = 0;
                None
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let bound = self.end.saturating_sub(self.next_offset);
        let upper = usize::try_from(bound).map_or(self.remaining, |b| b.min(self.remaining));
        (0, Some(upper))
    }
}

impl std::iter::FusedIterator for ReadRange {}

/// Records read before the first failure, and that failure if there was one.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    pub error: Option<LogError>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<LogResult<Record>> for Batch {
    fn from_iter<I: IntoIterator<Item = LogResult<Record>>>(iter: I) -> Self {
        let mut batch = Batch::default();
        for item in iter {
            match item {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    batch.error = Some(e);
                    break;
                }
            }
        }
        batch
    }
}
