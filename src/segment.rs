// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Segment files.
//!
//! A segment is a `{base:020}.log` data file plus its `{base:020}.index`
//! sparse index. Only the active segment accepts appends; once sealed it is
//! read-only for the rest of its life.
//!
//! Appends go through a [`WriteCursor`], which either commits (the frame is
//! written and `sync_data` returned) or, when dropped uncommitted, truncates
//! the file back to the last committed length. Readers never look past the
//! committed length, which is published only after the sync.

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::index::{IndexStride, SparseIndex, StrideState};
use eventsource_persistence::idx::{self, IndexEntry};
use eventsource_persistence::record::{read_frame, Record};
use eventsource_persistence::PersistenceError;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

pub const LOG_EXTENSION: &str = "log";
pub const INDEX_EXTENSION: &str = "index";

pub fn log_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, LOG_EXTENSION))
}

pub fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, INDEX_EXTENSION))
}

/// Parse the base offset out of a segment data file name.
pub fn parse_base_offset(path: &Path) -> Option<u64> {
    if path.extension()? != LOG_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Per-segment knobs derived from [`LogConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    pub stride: IndexStride,
}

impl From<&LogConfig> for SegmentOptions {
    fn from(config: &LogConfig) -> Self {
        Self {
            stride: IndexStride::new(config.index_interval_records, config.index_interval_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub base_offset: u64,
    /// One past the last record in the segment. Equal to `base_offset` when empty.
    pub next_offset: u64,
    pub size_bytes: u64,
    pub index_entries: usize,
    pub sealed: bool,
}

/// Scoped write on the active data file.
///
/// Dropping the cursor without [`commit`](WriteCursor::commit) truncates the
/// file back to `start` and syncs. If even that fails the segment is flagged
/// damaged and refuses further appends.
pub(crate) struct WriteCursor<'a> {
    file: &'a mut File,
    start: u64,
    committed: bool,
    damaged: &'a AtomicBool,
}

impl<'a> WriteCursor<'a> {
    pub(crate) fn begin(file: &'a mut File, start: u64, damaged: &'a AtomicBool) -> Self {
        Self {
            file,
            start,
            committed: false,
            damaged,
        }
    }

    pub(crate) fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }

    pub(crate) fn commit(mut self) -> io::Result<()> {
        self.file.sync_data()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteCursor<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let rolled_back = self
            .file
            .set_len(self.start)
            .and_then(|_| self.file.sync_data());
        match rolled_back {
            Ok(()) => debug!(position = self.start, "rolled back uncommitted write"),
            Err(e) => {
                error!(position = self.start, error = %e, "rollback of uncommitted write failed");
                self.damaged.store(true, Ordering::Release);
            }
        }
    }
}

struct ActiveWriter {
    data: File,
    index: File,
    stride: StrideState,
}

pub struct Segment {
    base_offset: u64,
    log_path: PathBuf,
    index_path: PathBuf,
    opts: SegmentOptions,
    created_at: SystemTime,
    committed_len: AtomicU64,
    next_offset: AtomicU64,
    damaged: AtomicBool,
    index: RwLock<SparseIndex>,
    /// `None` once sealed.
    writer: Mutex<Option<ActiveWriter>>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("next_offset", &self.next_offset())
            .field("committed_len", &self.committed_len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Segment {
    /// Create a new, empty active segment.
    pub fn create(dir: &Path, base_offset: u64, opts: SegmentOptions) -> LogResult<Self> {
        let log_path = log_path(dir, base_offset);
        let index_path = index_path(dir, base_offset);

        let data = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&log_path)?;
        let index = OpenOptions::new()
            .append(true)
            .create(true)
            .truncate(false)
            .open(&index_path)?;
        index.set_len(0)?;
        data.sync_all()?;
        index.sync_all()?;
        sync_dir(dir)?;

        info!(base_offset, path = %log_path.display(), "created segment");

        Ok(Self {
            base_offset,
            log_path,
            index_path,
            opts,
            created_at: SystemTime::now(),
            committed_len: AtomicU64::new(0),
            next_offset: AtomicU64::new(base_offset),
            damaged: AtomicBool::new(false),
            index: RwLock::new(SparseIndex::new()),
            writer: Mutex::new(Some(ActiveWriter {
                data,
                index,
                stride: StrideState::default(),
            })),
        })
    }

    /// Open an existing segment, validating its contents.
    ///
    /// The index is loaded and trusted up to its last entry, then the data is
    /// scanned from there to the end. A missing or inconsistent index is rebuilt
    /// from a full scan. A damaged tail is truncated when `active` is set and
    /// nothing valid follows it. Any other damage is an error.
    pub fn open(dir: &Path, base_offset: u64, opts: SegmentOptions, active: bool) -> LogResult<Self> {
        let log_path = log_path(dir, base_offset);
        let index_path = index_path(dir, base_offset);

        let data = OpenOptions::new().read(true).append(true).open(&log_path)?;
        let metadata = data.metadata()?;
        let len = metadata.len();
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or_else(|_| SystemTime::now());

        let loaded = load_index(&index_path, base_offset, len);
        let loaded_entries = loaded.as_ref().map(|i| i.entries().to_vec());

        let mut scan = match loaded {
            Some(index) => {
                let scan = Scan::run(&log_path, base_offset, index, len, opts)?;
                if scan.resumed_cleanly() {
                    scan
                } else {
                    warn!(base_offset, "index disagrees with data file, rebuilding");
                    Scan::run(&log_path, base_offset, SparseIndex::new(), len, opts)?
                }
            }
            None => Scan::run(&log_path, base_offset, SparseIndex::new(), len, opts)?,
        };

        if let Some((position, source)) = scan.fault.take() {
            // A torn write only ever damages the last frame. Anything with a
            // valid frame behind it is corruption of committed data.
            if !active || scan.misordered || frame_follows(&log_path, base_offset, position, len)? {
                return Err(LogError::CorruptFrame {
                    segment: base_offset,
                    position,
                    source,
                });
            }
            warn!(
                base_offset,
                position,
                dropped_bytes = len - scan.valid_end,
                error = %source,
                "truncating damaged tail of active segment"
            );
            data.set_len(scan.valid_end)?;
            data.sync_all()?;
            scan.index.truncate_from(scan.valid_end);
        }

        if loaded_entries.as_deref() != Some(scan.index.entries()) {
            idx::write_all(&index_path, scan.index.entries())?;
        }

        let writer = if active {
            let index = OpenOptions::new().append(true).open(&index_path)?;
            Some(ActiveWriter {
                data,
                index,
                stride: scan.stride,
            })
        } else {
            None
        };

        debug!(
            base_offset,
            next_offset = scan.next_offset,
            size = scan.valid_end,
            index_entries = scan.index.len(),
            active,
            "opened segment"
        );

        Ok(Self {
            base_offset,
            log_path,
            index_path,
            opts,
            created_at,
            committed_len: AtomicU64::new(scan.valid_end),
            next_offset: AtomicU64::new(scan.next_offset),
            damaged: AtomicBool::new(false),
            index: RwLock::new(scan.index),
            writer: Mutex::new(writer),
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.next_offset() == self.base_offset
    }

    pub fn is_sealed(&self) -> bool {
        self.writer.lock().is_none()
    }

    pub fn is_damaged(&self) -> bool {
        self.damaged.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            base_offset: self.base_offset,
            next_offset: self.next_offset(),
            size_bytes: self.committed_len(),
            index_entries: self.index.read().len(),
            sealed: self.is_sealed(),
        }
    }

    /// Whether a frame of `frame_len` bytes should go into a fresh segment.
    /// An empty segment never rolls, so an oversized record still lands somewhere.
    pub fn should_roll(&self, frame_len: u64, max_bytes: u64, max_age: Option<Duration>) -> bool {
        if self.is_empty() {
            return false;
        }
        self.committed_len() + frame_len > max_bytes || max_age.is_some_and(|age| self.age() >= age)
    }

    /// Durably append one record, returning its byte position.
    ///
    /// The record's offset must be this segment's next offset.
    pub fn append(&self, record: &Record) -> LogResult<u64> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| {
            LogError::Fatal(format!("segment {} is sealed", self.base_offset))
        })?;
        if self.is_damaged() {
            return Err(LogError::Fatal(format!(
                "segment {} could not roll back a failed write",
                self.base_offset
            )));
        }

        let expected = self.next_offset();
        if record.offset != expected {
            return Err(LogError::InvalidRecord(format!(
                "segment {} expects offset {}, got {}",
                self.base_offset, expected, record.offset
            )));
        }

        let frame = record
            .encode()
            .map_err(|e| LogError::InvalidRecord(e.to_string()))?;
        let position = self.committed_len();

        let mut cursor = WriteCursor::begin(&mut writer.data, position, &self.damaged);
        cursor
            .write(&frame)
            .map_err(|source| LogError::AppendFailed { source })?;
        cursor
            .commit()
            .map_err(|source| LogError::AppendFailed { source })?;

        let frame_len = frame.len() as u64;
        let due = writer.stride.is_due(&self.opts.stride);
        if due && self.index.write().record(record.offset, position) {
            // The data is already durable. A lost entry only makes the index
            // sparser; seal rewrites the file from memory.
            if let Err(e) = idx::append_entry(
                &mut writer.index,
                IndexEntry {
                    offset: record.offset,
                    position,
                },
            ) {
                warn!(base_offset = self.base_offset, error = %e, "failed to append index entry");
            }
        }
        writer.stride.advance(frame_len, due);

        self.committed_len.store(position + frame_len, Ordering::Release);
        self.next_offset.store(record.offset + 1, Ordering::Release);
        Ok(position)
    }

    /// Seal the segment: sync the data file, rewrite the full index durably and
    /// stop accepting appends. Returns the frozen index. Sealing twice is a no-op.
    pub fn seal(&self) -> LogResult<SparseIndex> {
        let mut guard = self.writer.lock();
        if let Some(writer) = guard.as_mut() {
            writer.data.sync_all()?;
            idx::write_all(&self.index_path, self.index.read().entries())?;
            *guard = None;
            info!(
                base_offset = self.base_offset,
                next_offset = self.next_offset(),
                size = self.committed_len(),
                "sealed segment"
            );
        }
        Ok(self.index.read().clone())
    }

    /// Flush the active index file without sealing.
    pub fn flush(&self) -> LogResult<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.data.sync_data()?;
            writer.index.sync_data()?;
        }
        Ok(())
    }

    /// A cursor over the committed records of this segment, starting at the
    /// first record with offset >= `offset`.
    pub fn cursor_from(&self, offset: u64) -> LogResult<SegmentCursor> {
        let position = self.index.read().lookup(offset);
        let mut cursor =
            SegmentCursor::open(&self.log_path, self.base_offset, position, self.committed_len())?;
        cursor.skip_until(offset)?;
        Ok(cursor)
    }

    /// The frame at a known byte position, or `None` at the end of committed data.
    pub fn read_at(&self, position: u64) -> LogResult<Option<Record>> {
        let limit = self.committed_len();
        if position >= limit {
            return Ok(None);
        }
        let mut cursor = SegmentCursor::open(&self.log_path, self.base_offset, position, limit)?;
        cursor.next_record()
    }

    pub fn read(&self, offset: u64) -> LogResult<Record> {
        if offset < self.base_offset || offset >= self.next_offset() {
            return Err(LogError::NotFound { offset });
        }
        let mut cursor = self.cursor_from(offset)?;
        match cursor.next_record()? {
            Some(record) if record.offset == offset => Ok(record),
            _ => Err(LogError::NotFound { offset }),
        }
    }

    /// Offset of the record carrying `(producer_id, sequence)`, if any.
    pub fn find(&self, producer_id: &str, sequence: u64) -> LogResult<Option<u64>> {
        let mut cursor = self.cursor_from(self.base_offset)?;
        while let Some(record) = cursor.next_record()? {
            if record.sequence == sequence && record.producer_id == producer_id {
                return Ok(Some(record.offset));
            }
        }
        Ok(None)
    }
}

fn load_index(path: &Path, base_offset: u64, data_len: u64) -> Option<SparseIndex> {
    match idx::read_all(path) {
        Ok(entries) => {
            let consistent = match (entries.first(), entries.last()) {
                (Some(first), Some(last)) => {
                    first.offset == base_offset && first.position == 0 && last.position < data_len
                }
                _ => data_len == 0,
            };
            if consistent {
                Some(SparseIndex::from_entries(entries))
            } else {
                warn!(base_offset, path = %path.display(), "index does not match data file, rebuilding");
                None
            }
        }
        Err(PersistenceError::IoError(e)) if e.kind() == ErrorKind::NotFound => {
            info!(base_offset, "index file missing, rebuilding");
            None
        }
        Err(e) => {
            warn!(base_offset, error = %e, "index file unreadable, rebuilding");
            None
        }
    }
}

/// Whether a valid frame starts right after the damaged frame at `position`,
/// judged by the length prefix stored there.
fn frame_follows(path: &Path, segment: u64, position: u64, len: u64) -> LogResult<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(position))?;
    let mut prefix = [0u8; 4];
    if len.saturating_sub(position) < prefix.len() as u64 {
        return Ok(false);
    }
    file.read_exact(&mut prefix)?;
    let next = position + prefix.len() as u64 + u64::from(u32::from_le_bytes(prefix));
    if next >= len {
        return Ok(false);
    }
    let mut cursor = SegmentCursor::open(path, segment, next, len)?;
    Ok(matches!(cursor.next_record(), Ok(Some(_))))
}

/// Result of validating a data file during open.
struct Scan {
    index: SparseIndex,
    stride: StrideState,
    valid_end: u64,
    next_offset: u64,
    /// Position scanning started from and the offset expected there.
    resumed_from: Option<IndexEntry>,
    first_frame_ok: bool,
    fault: Option<(u64, PersistenceError)>,
    /// The fault is an intact frame carrying the wrong offset.
    misordered: bool,
}

impl Scan {
    /// Scan frames from the last entry of `index` (or the start) to `len`,
    /// extending `index` at the configured stride.
    fn run(
        path: &Path,
        base_offset: u64,
        mut index: SparseIndex,
        len: u64,
        opts: SegmentOptions,
    ) -> LogResult<Self> {
        let resumed_from = index.last();
        let (start_position, mut expected) = resumed_from
            .map_or((0, base_offset), |e| (e.position, e.offset));

        let mut cursor = SegmentCursor::open(path, base_offset, start_position, len)?;
        let mut stride = StrideState::default();
        let mut first_frame_ok = false;
        let mut fault = None;
        let mut misordered = false;

        loop {
            let position = cursor.position();
            match cursor.next_record() {
                Ok(Some(record)) => {
                    if record.offset != expected {
                        fault = Some((
                            position,
                            PersistenceError::InvalidFormat(format!(
                                "expected offset {}, found {}",
                                expected, record.offset
                            )),
                        ));
                        misordered = true;
                        break;
                    }
                    let due = stride.is_due(&opts.stride);
                    if due {
                        index.record(record.offset, position);
                    }
                    stride.advance(cursor.position() - position, due);
                    first_frame_ok = true;
                    expected += 1;
                }
                Ok(None) => break,
                Err(LogError::CorruptFrame { position, source, .. }) => {
                    fault = Some((position, source));
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let valid_end = match &fault {
            Some((position, _)) => *position,
            None => cursor.position(),
        };

        Ok(Self {
            index,
            stride,
            valid_end,
            next_offset: expected,
            resumed_from,
            first_frame_ok,
            fault,
            misordered,
        })
    }

    /// False when the scan resumed from an index entry that does not point at
    /// a valid frame with the indexed offset.
    fn resumed_cleanly(&self) -> bool {
        self.resumed_from.is_none() || self.first_frame_ok
    }
}

/// Sequential reader over the committed bytes of one segment.
pub struct SegmentCursor {
    segment: u64,
    reader: BufReader<File>,
    position: u64,
    limit: u64,
    pending: Option<Record>,
}

impl SegmentCursor {
    fn open(path: &Path, segment: u64, position: u64, limit: u64) -> LogResult<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(position))?;
        Ok(Self {
            segment,
            reader: BufReader::new(file),
            position,
            limit,
            pending: None,
        })
    }

    /// Byte position of the next frame to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn skip_until(&mut self, offset: u64) -> LogResult<()> {
        while let Some(record) = self.read_frame()? {
            if record.offset >= offset {
                self.pending = Some(record);
                break;
            }
        }
        Ok(())
    }

    pub fn next_record(&mut self) -> LogResult<Option<Record>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        self.read_frame()
    }

    fn read_frame(&mut self) -> LogResult<Option<Record>> {
        let remaining = self.limit.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(None);
        }
        // No frame can extend past the committed bytes of the segment.
        let max_frame = usize::try_from(remaining).unwrap_or(usize::MAX);
        let decoded = read_frame((&mut self.reader).take(remaining), max_frame)
            .and_then(|frame| frame.map(|f| Record::decode(&f)).transpose());
        match decoded {
            Ok(Some((record, consumed))) => {
                self.position += consumed as u64;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(PersistenceError::IoError(e)) => Err(LogError::Storage(e)),
            Err(source) => Err(LogError::CorruptFrame {
                segment: self.segment,
                position: self.position,
                source,
            }),
        }
    }
}
