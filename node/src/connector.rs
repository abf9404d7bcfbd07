// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sink contract for connectors.

use async_trait::async_trait;
use eventsource_kernel::Record;

/// A sink's answer to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Processed. The connector acknowledges the offset and moves on.
    Ack,
    /// Not processed. The same record is delivered again after the retry backoff.
    Nack(String),
}

/// Downstream consumer of committed records.
///
/// Records arrive one at a time in offset order. Delivery is at-least-once: a
/// record may be seen again after a Nack or a restart, so sinks should use
/// `record.offset` or `(producer_id, sequence)` to drop repeats.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Stable name. Also the consumer name its progress is stored under.
    fn name(&self) -> &str;

    async fn deliver(&self, record: &Record) -> Delivery;
}
