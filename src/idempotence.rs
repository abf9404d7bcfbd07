// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Producer idempotence tracking.
//!
//! Each producer has a last committed sequence number and a short window of
//! recent `(sequence, offset)` pairs. Any sequence at or below the last
//! committed one is a replay. Inside the window the original offset is known
//! directly; older replays are resolved by the log engine with a scan.
//!
//! A sequence below the window is provably skipped while the window still
//! holds the producer's whole history, which stops being true once the window
//! has dropped pairs or any producer has been evicted.
//!
//! The tracker holds at most `max_producers` entries and evicts the producer
//! whose last commit is oldest.

use crate::error::{LogError, LogResult};
use eventsource_persistence::snapshot::{self, SnapshotHeader, SnapshotKind};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tracing::debug;

pub const PRODUCERS_SNAPSHOT: &str = "producers.snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Never committed. Proceed with the append.
    Fresh,
    /// Already committed at this offset.
    Duplicate(u64),
    /// At or below the last committed sequence, but older than the window.
    OutsideWindow { last_committed: u64 },
    /// Within the window's span but never committed (the producer skipped it).
    Skipped { last_committed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProducerState {
    last_sequence: u64,
    /// Ascending by sequence.
    window: VecDeque<(u64, u64)>,
    /// The window has dropped older pairs.
    trimmed: bool,
    #[serde(skip)]
    tick: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody {
    /// Least recently committed first.
    producers: Vec<(String, ProducerState)>,
    evicted: bool,
}

#[derive(Debug)]
pub struct IdempotenceTracker {
    producers: FxHashMap<String, ProducerState>,
    by_commit: BTreeMap<u64, String>,
    tick: u64,
    max_producers: usize,
    window: usize,
    /// Some producer was dropped, so an unknown producer may have history.
    evicted: bool,
}

impl IdempotenceTracker {
    pub fn new(max_producers: usize, window: usize) -> Self {
        Self {
            producers: FxHashMap::default(),
            by_commit: BTreeMap::new(),
            tick: 0,
            max_producers: max_producers.max(1),
            window: window.max(1),
            evicted: false,
        }
    }

    pub fn check(&self, producer_id: &str, sequence: u64) -> Verdict {
        let Some(state) = self.producers.get(producer_id) else {
            return Verdict::Fresh;
        };
        if sequence > state.last_sequence {
            return Verdict::Fresh;
        }
        let last_committed = state.last_sequence;
        match state.window.binary_search_by_key(&sequence, |&(seq, _)| seq) {
            Ok(i) => Verdict::Duplicate(state.window[i].1),
            Err(0) if state.trimmed || self.evicted => Verdict::OutsideWindow { last_committed },
            Err(_) => Verdict::Skipped { last_committed },
        }
    }

    /// Record a durable commit. Must only be called after the append succeeded.
    pub fn record_commit(&mut self, producer_id: &str, sequence: u64, offset: u64) {
        self.tick += 1;
        let tick = self.tick;

        match self.producers.get_mut(producer_id) {
            Some(state) => {
                if sequence <= state.last_sequence {
                    return;
                }
                self.by_commit.remove(&state.tick);
                state.last_sequence = sequence;
                state.window.push_back((sequence, offset));
                while state.window.len() > self.window {
                    state.window.pop_front();
                    state.trimmed = true;
                }
                state.tick = tick;
            }
            None => {
                let mut window = VecDeque::with_capacity(self.window);
                window.push_back((sequence, offset));
                self.producers.insert(
                    producer_id.to_owned(),
                    ProducerState {
                        last_sequence: sequence,
                        window,
                        trimmed: false,
                        tick,
                    },
                );
            }
        }
        self.by_commit.insert(tick, producer_id.to_owned());
        self.evict();
    }

    fn evict(&mut self) {
        while self.producers.len() > self.max_producers {
            let Some((_, oldest)) = self.by_commit.pop_first() else {
                break;
            };
            self.producers.remove(&oldest);
            self.evicted = true;
            debug!(producer_id = %oldest, "evicted idle producer from idempotence cache");
        }
    }

    pub fn last_sequence(&self, producer_id: &str) -> Option<u64> {
        self.producers.get(producer_id).map(|s| s.last_sequence)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn contains(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    fn encode(&self) -> LogResult<Vec<u8>> {
        let producers = self
            .by_commit
            .values()
            .filter_map(|id| self.producers.get(id).map(|s| (id.clone(), s.clone())))
            .collect();
        let body = SnapshotBody {
            producers,
            evicted: self.evicted,
        };
        bincode::serde::encode_to_vec(&body, bincode::config::standard())
            .map_err(|e| LogError::Snapshot(e.to_string()))
    }

    /// Write the tracker to `dir` as covering every offset below `as_of`.
    pub fn save(&self, dir: &Path, as_of: u64, timestamp: u64) -> LogResult<()> {
        let body = self.encode()?;
        let header = SnapshotHeader::new(SnapshotKind::Producers, as_of, timestamp, &body)?;
        snapshot::write_to(dir.join(PRODUCERS_SNAPSHOT), &header, &body)?;
        debug!(as_of, producers = self.len(), "saved producer snapshot");
        Ok(())
    }

    /// Load a snapshot from `dir`. Returns the tracker and the offset the
    /// snapshot covers up to (exclusive), or `None` if there is no snapshot.
    pub fn load(dir: &Path, max_producers: usize, window: usize) -> LogResult<Option<(Self, u64)>> {
        let Some((header, body)) =
            snapshot::read_snapshot(dir.join(PRODUCERS_SNAPSHOT), SnapshotKind::Producers)?
        else {
            return Ok(None);
        };
        let (decoded, _): (SnapshotBody, usize) =
            bincode::serde::decode_from_slice(&body, bincode::config::standard())
                .map_err(|e| LogError::Snapshot(e.to_string()))?;

        let mut tracker = Self::new(max_producers, window);
        tracker.evicted = decoded.evicted;
        for (producer_id, mut state) in decoded.producers {
            tracker.tick += 1;
            state.tick = tracker.tick;
            while state.window.len() > tracker.window {
                state.window.pop_front();
                state.trimmed = true;
            }
            tracker.by_commit.insert(state.tick, producer_id.clone());
            tracker.producers.insert(producer_id, state);
        }
        tracker.evict();
        Ok(Some((tracker, header.as_of)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_verdicts() {
        let mut tracker = IdempotenceTracker::new(8, 2);
        assert_eq!(tracker.check("p", 1), Verdict::Fresh);

        tracker.record_commit("p", 1, 10);
        tracker.record_commit("p", 2, 11);
        tracker.record_commit("p", 5, 12);

        assert_eq!(tracker.check("p", 5), Verdict::Duplicate(12));
        assert_eq!(tracker.check("p", 2), Verdict::Duplicate(11));
        assert_eq!(tracker.check("p", 3), Verdict::Skipped { last_committed: 5 });
        assert_eq!(tracker.check("p", 1), Verdict::OutsideWindow { last_committed: 5 });
        assert_eq!(tracker.check("p", 6), Verdict::Fresh);
    }

    #[test]
    fn test_stale_commit_ignored() {
        let mut tracker = IdempotenceTracker::new(8, 4);
        tracker.record_commit("p", 3, 1);
        tracker.record_commit("p", 2, 2);
        assert_eq!(tracker.last_sequence("p"), Some(3));
        // The window holds p's whole history, so 2 was never committed.
        assert_eq!(tracker.check("p", 2), Verdict::Skipped { last_committed: 3 });
    }

    #[test]
    fn test_below_trimmed_window_needs_scan() {
        let mut tracker = IdempotenceTracker::new(8, 2);
        for seq in 1..=4 {
            tracker.record_commit("p", seq, seq + 100);
        }
        assert_eq!(tracker.check("p", 1), Verdict::OutsideWindow { last_committed: 4 });
        assert_eq!(tracker.check("p", 3), Verdict::Duplicate(103));
    }

    #[test]
    fn test_evicts_least_recently_committed() {
        let dir = tempdir().unwrap();
        let mut tracker = IdempotenceTracker::new(2, 4);
        tracker.record_commit("a", 1, 1);
        tracker.record_commit("b", 1, 2);
        tracker.record_commit("a", 2, 3);
        tracker.record_commit("c", 1, 4);

        assert!(!tracker.contains("b"));
        assert!(tracker.contains("a"));
        assert!(tracker.contains("c"));
        assert_eq!(tracker.len(), 2);
        // b may have history in the log: re-admitted producers are scanned for.
        tracker.record_commit("b", 5, 5);
        assert!(!tracker.contains("a"));
        assert_eq!(tracker.check("b", 2), Verdict::OutsideWindow { last_committed: 5 });

        tracker.save(dir.path(), 6, 0).unwrap();
        let (mut loaded, as_of) = IdempotenceTracker::load(dir.path(), 2, 4).unwrap().unwrap();
        assert_eq!(as_of, 6);
        assert!(loaded.contains("c") && loaded.contains("b"));
        assert_eq!(loaded.check("b", 2), Verdict::OutsideWindow { last_committed: 5 });

        // c is still the older of the two after the reload.
        loaded.record_commit("d", 1, 6);
        assert!(!loaded.contains("c"));
        assert!(loaded.contains("b"));
        assert!(loaded.contains("d"));
    }

    #[test]
    fn test_load_with_fewer_producers_evicts_oldest() {
        let dir = tempdir().unwrap();
        let mut tracker = IdempotenceTracker::new(4, 4);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            tracker.record_commit(id, 1, i as u64 + 1);
        }
        tracker.save(dir.path(), 4, 0).unwrap();

        let (loaded, _) = IdempotenceTracker::load(dir.path(), 2, 4).unwrap().unwrap();
        assert!(!loaded.contains("a"));
        assert!(loaded.contains("b") && loaded.contains("c"));
    }
}
