pub mod recovery_tests;
pub mod e2e_tests;

use crate::config::LogConfig;
use bytes::Bytes;

/// Small thresholds so tests exercise strides and rollover quickly.
pub(crate) fn small_config(index_records: u32, index_bytes: u64, segment_bytes: u64) -> LogConfig {
    LogConfig {
        segment_max_bytes: segment_bytes,
        index_interval_records: index_records,
        index_interval_bytes: index_bytes,
        ..LogConfig::default()
    }
}

pub(crate) fn payload(i: u64) -> Bytes {
    Bytes::from(format!("event-{:04}", i))
}
