// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Log configuration.

use crate::error::{LogError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default segment size threshold (1 GiB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 1 << 30;

/// Default sparse index stride in records.
pub const DEFAULT_INDEX_INTERVAL_RECORDS: u32 = 64;

/// Default sparse index stride in bytes.
pub const DEFAULT_INDEX_INTERVAL_BYTES: u64 = 1 << 12;

/// Maximum size in bytes for a single record payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1 << 20;

/// Number of producers tracked before the least recently committed is evicted.
pub const DEFAULT_MAX_PRODUCERS: usize = 10_000;

/// Recent `(sequence, offset)` pairs remembered per producer.
pub const DEFAULT_PRODUCER_WINDOW: usize = 32;

/// Longest accepted producer id, in bytes.
pub const MAX_PRODUCER_ID_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Roll the active segment before an append that would take it past this size.
    pub segment_max_bytes: u64,
    /// Roll the active segment once it is older than this many seconds.
    pub segment_max_age_secs: Option<u64>,
    /// Record an index entry at least every this many records.
    pub index_interval_records: u32,
    /// Record an index entry at least every this many bytes.
    pub index_interval_bytes: u64,
    /// Largest payload (and key) accepted by `append`. Not applied to records
    /// already on disk.
    pub max_payload_bytes: usize,
    pub max_producers: usize,
    pub producer_window: usize,
    /// Persist consumer offsets on every advancing acknowledgement.
    pub sync_offsets_on_ack: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            segment_max_age_secs: None,
            index_interval_records: DEFAULT_INDEX_INTERVAL_RECORDS,
            index_interval_bytes: DEFAULT_INDEX_INTERVAL_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_producers: DEFAULT_MAX_PRODUCERS,
            producer_window: DEFAULT_PRODUCER_WINDOW,
            sync_offsets_on_ack: true,
        }
    }
}

impl LogConfig {
    pub fn segment_max_age(&self) -> Option<Duration> {
        self.segment_max_age_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_max_bytes == 0 {
            return Err(LogError::Config("segment_max_bytes must be positive".into()));
        }
        if self.index_interval_records == 0 {
            return Err(LogError::Config("index_interval_records must be positive".into()));
        }
        if self.index_interval_bytes == 0 {
            return Err(LogError::Config("index_interval_bytes must be positive".into()));
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > u32::MAX as usize / 4 {
            return Err(LogError::Config(format!(
                "max_payload_bytes must be in 1..={}",
                u32::MAX / 4
            )));
        }
        if self.max_producers == 0 {
            return Err(LogError::Config("max_producers must be positive".into()));
        }
        if self.producer_window == 0 {
            return Err(LogError::Config("producer_window must be positive".into()));
        }
        Ok(())
    }
}
