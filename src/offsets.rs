// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Consumer offset tracking.
//!
//! Every consumer owns an atomic cell holding its last acknowledged offset, so
//! acknowledgements from different consumers never contend. Acknowledgement is
//! monotonic: a lower or equal offset leaves the cell untouched.

use crate::error::{LogError, LogResult};
use crate::now_millis;
use eventsource_persistence::snapshot::{self, SnapshotHeader, SnapshotKind};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const CONSUMER_OFFSETS: &str = "consumers.offsets";

/// No acknowledgement yet. Real offsets start at 1.
const UNACKED: u64 = 0;

#[derive(Debug)]
pub struct ConsumerOffsets {
    path: PathBuf,
    cells: RwLock<FxHashMap<String, Arc<AtomicU64>>>,
    /// Serializes snapshot writes.
    persist: Mutex<()>,
    /// Set while the file lags behind the cells.
    dirty: AtomicBool,
    sync_on_ack: bool,
}

impl ConsumerOffsets {
    /// Load offsets persisted in `dir`, or start empty.
    pub fn open(dir: &Path, sync_on_ack: bool) -> LogResult<Self> {
        let path = dir.join(CONSUMER_OFFSETS);
        let mut cells = FxHashMap::default();
        if let Some((_, body)) = snapshot::read_snapshot(&path, SnapshotKind::Consumers)? {
            let stored: BTreeMap<String, u64> =
                serde_json::from_slice(&body).map_err(|e| LogError::Snapshot(e.to_string()))?;
            for (name, offset) in stored {
                cells.insert(name, Arc::new(AtomicU64::new(offset)));
            }
            info!(consumers = cells.len(), "loaded consumer offsets");
        }
        Ok(Self {
            path,
            cells: RwLock::new(cells),
            persist: Mutex::new(()),
            dirty: AtomicBool::new(false),
            sync_on_ack,
        })
    }

    fn cell(&self, consumer: &str) -> Arc<AtomicU64> {
        if let Some(cell) = self.cells.read().get(consumer) {
            return Arc::clone(cell);
        }
        Arc::clone(
            self.cells
                .write()
                .entry(consumer.to_owned())
                .or_insert_with(|| Arc::new(AtomicU64::new(UNACKED))),
        )
    }

    /// Record that `consumer` has processed everything up to and including
    /// `offset`. Returns whether the stored offset advanced.
    ///
    /// With `sync_on_ack`, any acknowledgement retries a write that failed
    /// earlier, even one that does not advance.
    pub fn acknowledge(&self, consumer: &str, offset: u64) -> LogResult<bool> {
        let previous = self.cell(consumer).fetch_max(offset, Ordering::AcqRel);
        let advanced = offset > previous;
        if advanced {
            debug!(consumer, offset, "acknowledged");
            self.dirty.store(true, Ordering::Release);
        }
        if self.sync_on_ack && self.dirty.load(Ordering::Acquire) {
            self.persist()?;
        }
        Ok(advanced)
    }

    /// Whether some acknowledgement has not reached the offsets file yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn last_acknowledged(&self, consumer: &str) -> Option<u64> {
        let cells = self.cells.read();
        let offset = cells.get(consumer)?.load(Ordering::Acquire);
        (offset != UNACKED).then_some(offset)
    }

    /// The offset `consumer` should read next: last acknowledged + 1, or 0
    /// (the start of the log) for a consumer that has acknowledged nothing.
    pub fn resume_point(&self, consumer: &str) -> u64 {
        self.last_acknowledged(consumer).map_or(0, |offset| offset + 1)
    }

    pub fn consumers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn collect(&self) -> BTreeMap<String, u64> {
        self.cells
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.load(Ordering::Acquire)))
            .filter(|&(_, offset)| offset != UNACKED)
            .collect()
    }

    /// Atomically replace the offsets file with the current state.
    pub fn persist(&self) -> LogResult<()> {
        let _guard = self.persist.lock();
        // Cleared before collecting: an ack racing with this write marks it again.
        self.dirty.store(false, Ordering::Release);
        // Collected under the persist lock so a later writer never loses to an earlier one.
        let offsets = self.collect();
        let written = self.write_file(&offsets);
        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written
    }

    fn write_file(&self, offsets: &BTreeMap<String, u64>) -> LogResult<()> {
        let body = serde_json::to_vec(offsets).map_err(|e| LogError::Snapshot(e.to_string()))?;
        let as_of = offsets.values().copied().max().unwrap_or(UNACKED);
        let header = SnapshotHeader::new(SnapshotKind::Consumers, as_of, now_millis(), &body)?;
        snapshot::write_to(&self.path, &header, &body)?;
        Ok(())
    }
}
