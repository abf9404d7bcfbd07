// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The log engine.
//!
//! ```text
//! append ──► validate ──► idempotence check ──► roll? ──► segment append ──► publish
//!                               │                                             │
//!                               └── Duplicate(offset)          high-water + idempotence commit
//! ```
//!
//! Appends are serialized by the writer lock. Readers clone segment handles
//! out of the segment map and read through their own file handles, bounded by
//! the high-water mark, so they neither block the writer nor see partial frames.

use crate::config::{LogConfig, MAX_PRODUCER_ID_LEN};
use crate::error::{LogError, LogResult};
use crate::idempotence::{IdempotenceTracker, Verdict};
use crate::now_millis;
use crate::offsets::ConsumerOffsets;
use crate::replay::{Batch, ReadRange};
use crate::segment::{self, Segment, SegmentInfo, SegmentOptions};
use bytes::Bytes;
use eventsource_persistence::Record;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Offset assigned to the first record of an empty log.
pub const FIRST_OFFSET: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Committed(u64),
    /// The `(producer, sequence)` pair was already committed at this offset.
    Duplicate(u64),
}

impl AppendOutcome {
    pub fn offset(&self) -> u64 {
        match *self {
            AppendOutcome::Committed(offset) | AppendOutcome::Duplicate(offset) => offset,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

struct Writer {
    active: Arc<Segment>,
}

pub struct EventLog {
    dir: PathBuf,
    config: LogConfig,
    opts: SegmentOptions,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
    writer: Mutex<Writer>,
    /// Offset the next committed record will get. Published after the segment commit.
    next_offset: AtomicU64,
    producers: Mutex<IdempotenceTracker>,
    offsets: ConsumerOffsets,
    /// Set once the engine can no longer append.
    failure: RwLock<Option<String>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("dir", &self.dir)
            .field("segments", &self.segment_count())
            .field("next_offset", &self.next_offset.load(Ordering::Acquire))
            .finish()
    }
}

impl EventLog {
    /// Open (or create) the log in `dir`, recovering segments, producer state
    /// and consumer offsets before returning.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let opts = SegmentOptions::from(&config);

        let mut bases: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| segment::parse_base_offset(&entry.path()))
            .collect();
        bases.sort_unstable();

        let mut segments: BTreeMap<u64, Arc<Segment>> = BTreeMap::new();
        if bases.is_empty() {
            let segment = Segment::create(&dir, FIRST_OFFSET, opts)?;
            segments.insert(FIRST_OFFSET, Arc::new(segment));
        } else {
            let last = bases.len() - 1;
            for (i, &base) in bases.iter().enumerate() {
                let segment = Segment::open(&dir, base, opts, i == last)?;
                if let Some(previous) = segments.values().next_back() {
                    if previous.next_offset() != base {
                        return Err(LogError::Fatal(format!(
                            "segment {} ends at {} but the next segment starts at {}",
                            previous.base_offset(),
                            previous.next_offset(),
                            base
                        )));
                    }
                }
                segments.insert(base, Arc::new(segment));
            }
        }

        let (active, first_offset) = match (segments.values().next_back(), segments.keys().next()) {
            (Some(active), Some(&first)) => (Arc::clone(active), first),
            _ => return Err(LogError::Fatal("no active segment after open".into())),
        };
        let next_offset = active.next_offset();

        let producers = Self::recover_producers(&dir, &config, &segments, first_offset, next_offset)?;
        let offsets = ConsumerOffsets::open(&dir, config.sync_offsets_on_ack)?;

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            first_offset,
            next_offset,
            producers = producers.len(),
            "opened event log"
        );

        Ok(Self {
            dir,
            config,
            opts,
            segments: RwLock::new(segments),
            writer: Mutex::new(Writer { active }),
            next_offset: AtomicU64::new(next_offset),
            producers: Mutex::new(producers),
            offsets,
            failure: RwLock::new(None),
        })
    }

    /// Load the producer snapshot and replay every record committed after it.
    fn recover_producers(
        dir: &Path,
        config: &LogConfig,
        segments: &BTreeMap<u64, Arc<Segment>>,
        first_offset: u64,
        next_offset: u64,
    ) -> LogResult<IdempotenceTracker> {
        let fresh = || IdempotenceTracker::new(config.max_producers, config.producer_window);
        let (mut tracker, as_of) =
            match IdempotenceTracker::load(dir, config.max_producers, config.producer_window) {
                Ok(Some((tracker, as_of))) if as_of <= next_offset => (tracker, as_of),
                Ok(Some((_, as_of))) => {
                    warn!(as_of, next_offset, "producer snapshot is ahead of the log, rebuilding");
                    (fresh(), first_offset)
                }
                Ok(None) => (fresh(), first_offset),
                Err(e) => {
                    warn!(error = %e, "producer snapshot unreadable, rebuilding");
                    (fresh(), first_offset)
                }
            };

        let start = as_of.max(first_offset);
        let mut replayed = 0u64;
        for record in range_over(segments, start, next_offset, usize::MAX) {
            let record = record?;
            tracker.record_commit(&record.producer_id, record.sequence, record.offset);
            replayed += 1;
        }
        debug!(from = start, replayed, "replayed records into idempotence tracker");
        Ok(tracker)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn validate(&self, producer_id: &str, key: Option<&Bytes>, payload: &Bytes) -> LogResult<()> {
        if producer_id.is_empty() || producer_id.len() > MAX_PRODUCER_ID_LEN {
            return Err(LogError::InvalidRecord(format!(
                "producer id must be 1..={} bytes, got {}",
                MAX_PRODUCER_ID_LEN,
                producer_id.len()
            )));
        }
        if payload.len() > self.config.max_payload_bytes {
            return Err(LogError::InvalidRecord(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_payload_bytes
            )));
        }
        if let Some(key) = key {
            if key.len() > self.config.max_payload_bytes {
                return Err(LogError::InvalidRecord(format!(
                    "key of {} bytes exceeds limit of {}",
                    key.len(),
                    self.config.max_payload_bytes
                )));
            }
        }
        Ok(())
    }

    fn ensure_writable(&self) -> LogResult<()> {
        match self.failure.read().as_ref() {
            Some(reason) => Err(LogError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    /// Stop accepting appends and return the error to surface.
    fn fail(&self, reason: String) -> LogError {
        error!(reason = %reason, "event log refusing further appends");
        let mut failure = self.failure.write();
        failure.get_or_insert_with(|| reason.clone());
        LogError::Fatal(reason)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.read().is_some()
    }

    /// Idempotently append one record.
    ///
    /// Returns `Committed(offset)` once the record is durable, or
    /// `Duplicate(offset)` if this `(producer_id, sequence)` was committed
    /// before. On `AppendFailed` nothing was committed and the same call may be
    /// retried.
    pub fn append(
        &self,
        producer_id: &str,
        sequence: u64,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> LogResult<AppendOutcome> {
        self.validate(producer_id, key.as_ref(), &payload)?;

        let mut writer = self.writer.lock();
        self.ensure_writable()?;

        let verdict = self.producers.lock().check(producer_id, sequence);
        match verdict {
            Verdict::Fresh => {}
            Verdict::Duplicate(offset) => {
                debug!(producer_id, sequence, offset, "duplicate append");
                return Ok(AppendOutcome::Duplicate(offset));
            }
            Verdict::OutsideWindow { last_committed } => {
                return match self.find_committed(producer_id, sequence)? {
                    Some(offset) => {
                        debug!(producer_id, sequence, offset, "duplicate append resolved by scan");
                        Ok(AppendOutcome::Duplicate(offset))
                    }
                    None => Err(LogError::StaleSequence {
                        producer_id: producer_id.to_owned(),
                        sequence,
                        last_committed,
                    }),
                };
            }
            Verdict::Skipped { last_committed } => {
                return Err(LogError::StaleSequence {
                    producer_id: producer_id.to_owned(),
                    sequence,
                    last_committed,
                });
            }
        }

        let offset = self.next_offset.load(Ordering::Acquire);
        let record = Record {
            offset,
            timestamp: now_millis(),
            producer_id: producer_id.to_owned(),
            sequence,
            key,
            payload,
        };

        let frame_len = record.encoded_len() as u64;
        if writer.active.should_roll(
            frame_len,
            self.config.segment_max_bytes,
            self.config.segment_max_age(),
        ) {
            self.roll(&mut writer, offset)?;
        }

        match writer.active.append(&record) {
            Ok(_) => {}
            Err(e) if writer.active.is_damaged() => {
                return Err(self.fail(format!(
                    "segment {} is damaged: {}",
                    writer.active.base_offset(),
                    e
                )));
            }
            Err(e) => return Err(e),
        }

        self.next_offset.store(offset + 1, Ordering::Release);
        self.producers.lock().record_commit(producer_id, sequence, offset);
        Ok(AppendOutcome::Committed(offset))
    }

    /// Seal the active segment and start a new one at `base`.
    fn roll(&self, writer: &mut Writer, base: u64) -> LogResult<()> {
        let sealing = Arc::clone(&writer.active);
        if let Err(e) = sealing.seal() {
            return Err(self.fail(format!(
                "failed to seal segment {}: {}",
                sealing.base_offset(),
                e
            )));
        }
        let next = match Segment::create(&self.dir, base, self.opts) {
            Ok(segment) => Arc::new(segment),
            Err(e) => {
                return Err(self.fail(format!("failed to create segment {}: {}", base, e)));
            }
        };
        self.segments.write().insert(base, Arc::clone(&next));
        writer.active = next;

        info!(
            sealed = sealing.base_offset(),
            sealed_size = sealing.committed_len(),
            base_offset = base,
            "rolled over to new segment"
        );

        if let Err(e) = self.producers.lock().save(&self.dir, base, now_millis()) {
            warn!(error = %e, "failed to write producer snapshot on seal");
        }
        Ok(())
    }

    /// Scan the log, newest segment first, for the record carrying `(producer_id, sequence)`.
    fn find_committed(&self, producer_id: &str, sequence: u64) -> LogResult<Option<u64>> {
        let segments: Vec<Arc<Segment>> = self.segments.read().values().rev().cloned().collect();
        for segment in segments {
            if let Some(offset) = segment.find(producer_id, sequence)? {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn segment_for(&self, offset: u64) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .range(..=offset)
            .next_back()
            .map(|(_, segment)| Arc::clone(segment))
    }

    fn first_base(&self) -> u64 {
        self.segments
            .read()
            .keys()
            .next()
            .copied()
            .unwrap_or(FIRST_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.next_offset.load(Ordering::Acquire) == self.first_base()
    }

    /// One past the last committed offset, or 0 for an empty log.
    pub fn high_water_offset(&self) -> u64 {
        let next = self.next_offset.load(Ordering::Acquire);
        if next == self.first_base() {
            0
        } else {
            next
        }
    }

    pub fn first_offset(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.first_base())
    }

    pub fn last_offset(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.next_offset.load(Ordering::Acquire) - 1)
    }

    pub fn read(&self, offset: u64) -> LogResult<Record> {
        if offset < self.first_base() || offset >= self.next_offset.load(Ordering::Acquire) {
            return Err(LogError::NotFound { offset });
        }
        let segment = self.segment_for(offset).ok_or(LogError::NotFound { offset })?;
        segment.read(offset)
    }

    /// Up to `max_records` committed records starting at `start`. A start of 0
    /// (or anything before the first offset) means the beginning of the log.
    pub fn read_range(&self, start: u64, max_records: usize) -> ReadRange {
        let end = self.next_offset.load(Ordering::Acquire);
        let segments = self.segments.read();
        let first = segments.keys().next().copied().unwrap_or(FIRST_OFFSET);
        range_over(&segments, start.max(first), end, max_records)
    }

    pub fn read_batch(&self, start: u64, max_records: usize) -> LogResult<Vec<Record>> {
        self.read_range(start, max_records).collect()
    }

    /// Like [`read_batch`](Self::read_batch), but keeps the records read
    /// before a failure. The failed offset is the one after the last record.
    pub fn read_prefix(&self, start: u64, max_records: usize) -> Batch {
        self.read_range(start, max_records).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.read().values().map(|s| s.info()).collect()
    }

    pub fn offsets(&self) -> &ConsumerOffsets {
        &self.offsets
    }

    /// Monotonically advance `consumer` to `offset`. Lower offsets are a no-op.
    pub fn acknowledge(&self, consumer: &str, offset: u64) -> LogResult<bool> {
        self.offsets.acknowledge(consumer, offset)
    }

    /// Like [`acknowledge`](Self::acknowledge), but rejects offsets that were
    /// never committed.
    pub fn acknowledge_checked(&self, consumer: &str, offset: u64) -> LogResult<bool> {
        if offset < self.first_base() || offset >= self.next_offset.load(Ordering::Acquire) {
            return Err(LogError::NotFound { offset });
        }
        self.offsets.acknowledge(consumer, offset)
    }

    pub fn resume_point(&self, consumer: &str) -> u64 {
        self.offsets.resume_point(consumer)
    }

    pub fn consumers(&self) -> Vec<String> {
        self.offsets.consumers()
    }

    /// Flush the active segment and persist producer and consumer state.
    /// The log refuses appends afterwards.
    pub fn close(&self) -> LogResult<()> {
        let writer = self.writer.lock();
        if self.is_failed() {
            return self.offsets.persist();
        }
        writer.active.flush()?;
        let next = self.next_offset.load(Ordering::Acquire);
        self.producers.lock().save(&self.dir, next, now_millis())?;
        self.offsets.persist()?;
        *self.failure.write() = Some("event log is closed".into());
        info!(dir = %self.dir.display(), next_offset = next, "closed event log");
        Ok(())
    }
}

fn range_over(
    segments: &BTreeMap<u64, Arc<Segment>>,
    start: u64,
    end: u64,
    max_records: usize,
) -> ReadRange {
    if start >= end || max_records == 0 {
        return ReadRange::empty(start);
    }
    let from = segments
        .range(..=start)
        .next_back()
        .map_or(start, |(&base, _)| base);
    let handles = segments.range(from..).map(|(_, s)| Arc::clone(s)).collect();
    ReadRange::new(handles, start, end, max_records)
}
