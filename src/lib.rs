// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! eventsource-kernel: a segmented, append-only event log with a sparse
//! offset index, idempotent producers and durable consumer offsets.

pub mod config;
pub mod error;
pub mod index;
pub mod segment;
pub mod idempotence;
pub mod offsets;
pub mod replay;
pub mod log;

#[cfg(test)]
pub mod tests;

pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use eventsource_persistence::Record;
pub use log::{AppendOutcome, EventLog, FIRST_OFFSET};
pub use replay::{Batch, ReadRange};
pub use segment::SegmentInfo;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
