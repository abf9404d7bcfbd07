// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::LogConfig;
use crate::error::LogError;
use crate::idempotence::PRODUCERS_SNAPSHOT;
use crate::log::{AppendOutcome, EventLog};
use crate::segment;
use crate::tests::{payload, small_config};
use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;

fn fill(log: &EventLog, producer: &str, seqs: std::ops::RangeInclusive<u64>) {
    for seq in seqs {
        log.append(producer, seq, None, payload(seq)).unwrap();
    }
}

#[test]
fn test_reopen_after_close() {
    let dir = tempdir().unwrap();
    let config = small_config(4, 1 << 20, 400);
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=20);
        fill(&log, "B", 1..=5);
        log.acknowledge("sink", 17).unwrap();
        log.close().unwrap();
    }

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 26);
    assert_eq!(log.resume_point("sink"), 18);
    assert_eq!(log.append("A", 20, None, payload(20)).unwrap(), AppendOutcome::Duplicate(20));
    assert_eq!(log.append("B", 5, None, payload(5)).unwrap(), AppendOutcome::Duplicate(25));
    assert_eq!(log.append("B", 6, None, payload(6)).unwrap(), AppendOutcome::Committed(26));
}

#[test]
fn test_reopen_after_crash_without_snapshot() {
    let dir = tempdir().unwrap();
    let config = small_config(4, 1 << 20, 1 << 20);
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=10);
        // Dropped without close: no producer snapshot was ever written.
    }
    assert!(!dir.path().join(PRODUCERS_SNAPSHOT).exists());

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 11);
    assert_eq!(log.append("A", 7, None, payload(7)).unwrap(), AppendOutcome::Duplicate(7));
}

#[test]
fn test_snapshot_then_more_records_replayed() {
    let dir = tempdir().unwrap();
    // Small segments so rollover writes producer snapshots mid-stream.
    let config = small_config(2, 1 << 20, 200);
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=12);
        assert!(log.segment_count() > 1);
    }
    assert!(dir.path().join(PRODUCERS_SNAPSHOT).exists());

    let log = EventLog::open(dir.path(), config).unwrap();
    // Last record is after the last snapshot and must come from replay.
    assert_eq!(log.append("A", 12, None, payload(12)).unwrap(), AppendOutcome::Duplicate(12));
    assert_eq!(log.append("A", 13, None, payload(13)).unwrap(), AppendOutcome::Committed(13));
}

#[test]
fn test_partial_tail_truncated() {
    let dir = tempdir().unwrap();
    let config = small_config(4, 1 << 20, 1 << 20);
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=6);
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(segment::log_path(dir.path(), 1))
        .unwrap();
    file.write_all(&[0x2A, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(file);

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 7);
    assert_eq!(log.read_batch(0, 100).unwrap().len(), 6);
    assert_eq!(log.append("A", 7, None, payload(7)).unwrap(), AppendOutcome::Committed(7));
    assert_eq!(log.read(7).unwrap().payload, payload(7));
}

#[test]
fn test_snapshot_ahead_of_log_is_discarded() {
    let dir = tempdir().unwrap();
    let config = small_config(4, 1 << 20, 1 << 20);
    let good_len = {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=3);
        let len = log.segments()[0].size_bytes;
        fill(&log, "A", 4..=5);
        log.close().unwrap();
        len
    };
    // Lose the last two records after the snapshot recorded them.
    let file = OpenOptions::new()
        .write(true)
        .open(segment::log_path(dir.path(), 1))
        .unwrap();
    file.set_len(good_len).unwrap();
    drop(file);

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 4);
    assert_eq!(log.append("A", 4, None, payload(4)).unwrap(), AppendOutcome::Committed(4));
}

#[test]
fn test_corrupt_producer_snapshot_rebuilt() {
    let dir = tempdir().unwrap();
    let config = LogConfig::default();
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=4);
        log.close().unwrap();
    }
    fs::write(dir.path().join(PRODUCERS_SNAPSHOT), b"not a snapshot at all, just noise").unwrap();

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.append("A", 2, None, payload(2)).unwrap(), AppendOutcome::Duplicate(2));
}

#[test]
fn test_gap_between_segments_fails_open() {
    let dir = tempdir().unwrap();
    let config = small_config(4, 1 << 20, 200);
    let removed = {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=20);
        let segments = log.segments();
        assert!(segments.len() >= 3);
        segments[1].base_offset
    };
    fs::remove_file(segment::log_path(dir.path(), removed)).unwrap();
    fs::remove_file(segment::index_path(dir.path(), removed)).unwrap();

    assert!(matches!(EventLog::open(dir.path(), config), Err(LogError::Fatal(_))));
}

#[test]
fn test_missing_indexes_rebuilt_on_open() {
    let dir = tempdir().unwrap();
    let config = small_config(3, 1 << 20, 300);
    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        fill(&log, "A", 1..=30);
    }
    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "index") {
            fs::remove_file(path).unwrap();
        }
    }

    let log = EventLog::open(dir.path(), config).unwrap();
    for offset in 1..=30 {
        assert_eq!(log.read(offset).unwrap().sequence, offset);
    }
    assert!(log.segments().iter().all(|s| s.index_entries > 0));
}

#[test]
fn test_lower_payload_limit_keeps_committed_tail() {
    let dir = tempdir().unwrap();
    let big = Bytes::from(vec![7u8; 3000]);
    let file_len = {
        let log = EventLog::open(dir.path(), LogConfig::default()).unwrap();
        log.append("A", 1, None, Bytes::from_static(b"ten bytes!")).unwrap();
        log.append("A", 2, None, big.clone()).unwrap();
        log.close().unwrap();
        fs::metadata(segment::log_path(dir.path(), 1)).unwrap().len()
    };

    let config = LogConfig {
        max_payload_bytes: 1024,
        ..LogConfig::default()
    };
    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 3);
    assert_eq!(fs::metadata(segment::log_path(dir.path(), 1)).unwrap().len(), file_len);
    assert_eq!(log.read(2).unwrap().payload, big);

    // The lower limit still applies to new appends.
    assert!(matches!(
        log.append("A", 3, None, big.clone()),
        Err(LogError::InvalidRecord(_))
    ));
    assert_eq!(log.append("A", 3, None, payload(3)).unwrap(), AppendOutcome::Committed(3));
}

#[test]
fn test_lower_payload_limit_reads_indexed_records() {
    let dir = tempdir().unwrap();
    let big = Bytes::from(vec![9u8; 8000]);
    {
        let log = EventLog::open(dir.path(), small_config(1, 1 << 20, 1 << 20)).unwrap();
        log.append("A", 1, None, payload(1)).unwrap();
        log.append("A", 2, None, big.clone()).unwrap();
        log.append("A", 3, None, payload(3)).unwrap();
    }

    let config = LogConfig {
        max_payload_bytes: 1024,
        ..small_config(1, 1 << 20, 1 << 20)
    };
    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 4);
    assert_eq!(log.read(2).unwrap().payload, big);
    let offsets: Vec<u64> = log.read_batch(0, 10).unwrap().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![1, 2, 3]);
}
