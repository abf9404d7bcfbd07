// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Produce, consume, restart, consume again.

use crate::log::{AppendOutcome, EventLog};
use crate::tests::small_config;
use bytes::Bytes;
use tempfile::tempdir;

/// Drain everything after the consumer's resume point, acknowledging as we go.
fn consume(log: &EventLog, consumer: &str, batch: usize) -> Vec<u64> {
    let mut delivered = Vec::new();
    loop {
        let records = log.read_batch(log.resume_point(consumer), batch).unwrap();
        if records.is_empty() {
            return delivered;
        }
        for record in records {
            delivered.push(record.offset);
            log.acknowledge(consumer, record.offset).unwrap();
        }
    }
}

#[test]
fn test_produce_consume_restart() {
    let dir = tempdir().unwrap();
    let config = small_config(8, 512, 1024);

    {
        let log = EventLog::open(dir.path(), config.clone()).unwrap();
        for seq in 1..=50u64 {
            let key = Bytes::from(format!("account-{}", seq % 5));
            let body = Bytes::from(format!("{{\"deposit\":{}}}", seq * 10));
            let outcome = log.append("ledger", seq, Some(key), body).unwrap();
            assert_eq!(outcome, AppendOutcome::Committed(seq));
        }

        assert_eq!(consume(&log, "audit", 16), (1..=50).collect::<Vec<_>>());
        assert_eq!(consume(&log, "audit", 16), Vec::<u64>::new());

        // A second consumer only gets part way before the restart.
        let partial = log.read_batch(0, 20).unwrap();
        for record in &partial {
            log.acknowledge("mirror", record.offset).unwrap();
        }

        // Producer retries its last batch after a timeout.
        for seq in 45..=50u64 {
            let outcome = log.append("ledger", seq, None, Bytes::new()).unwrap();
            assert_eq!(outcome, AppendOutcome::Duplicate(seq));
        }
        log.close().unwrap();
    }

    let log = EventLog::open(dir.path(), config).unwrap();
    assert_eq!(log.high_water_offset(), 51);
    assert_eq!(log.resume_point("audit"), 51);
    assert_eq!(consume(&log, "mirror", 7), (21..=50).collect::<Vec<_>>());

    log.append("ledger", 51, None, Bytes::from_static(b"{\"deposit\":510}")).unwrap();
    assert_eq!(consume(&log, "audit", 16), vec![51]);

    let record = log.read(33).unwrap();
    assert_eq!(record.key, Some(Bytes::from("account-3")));
    assert_eq!(record.payload, Bytes::from("{\"deposit\":330}"));
}
