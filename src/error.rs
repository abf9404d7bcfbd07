//! Error types.

use eventsource_persistence::PersistenceError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    /// A frame failed length or checksum validation. Scoped to the read that hit it.
    #[error("corrupt frame in segment {segment} at byte {position}: {source}")]
    CorruptFrame {
        segment: u64,
        position: u64,
        #[source]
        source: PersistenceError,
    },

    /// The offset is before the start of the log or at/after the high-water mark.
    #[error("offset {offset} not found")]
    NotFound { offset: u64 },

    /// The storage write did not durably complete. Retry with the same producer id and sequence.
    #[error("append failed: {source}")]
    AppendFailed {
        #[source]
        source: io::Error,
    },

    /// The sequence is at or below the producer's last committed sequence, yet no
    /// committed record carries it, so there is no offset to answer with.
    #[error("producer {producer_id} sequence {sequence} is not above last committed {last_committed}")]
    StaleSequence {
        producer_id: String,
        sequence: u64,
        last_committed: u64,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Opening or sealing a segment failed. The engine refuses further appends.
    #[error("log engine failed: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

pub type LogResult<T> = core::result::Result<T, LogError>;
pub type Result<T> = LogResult<T>;
