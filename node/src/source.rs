// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Async facade over the event log.
//!
//! Engine calls do file I/O and are run on the blocking pool. Every commit
//! publishes the new high-water mark on a watch channel, which is what idle
//! connectors wait on.

use crate::config::NodeConfig;
use crate::errors::NodeResult;
use crate::telemetry::{APPEND_DURATION, DUPLICATES, RECORDS_APPENDED};
use bytes::Bytes;
use eventsource_kernel::{AppendOutcome, Batch, EventLog, Record};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task;
use tracing::info;

struct Inner {
    log: Arc<EventLog>,
    commits: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct EventSource {
    inner: Arc<Inner>,
}

impl EventSource {
    pub async fn open(config: &NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();
        let log_config = config.log.clone();
        let log = task::spawn_blocking(move || EventLog::open(dir, log_config)).await??;
        info!(data_dir = %config.data_dir.display(), high_water = log.high_water_offset(), "event source ready");
        Ok(Self::from_log(log))
    }

    pub fn from_log(log: EventLog) -> Self {
        let (commits, _) = watch::channel(log.high_water_offset());
        Self {
            inner: Arc::new(Inner {
                log: Arc::new(log),
                commits,
            }),
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.inner.log
    }

    /// Watch the high-water mark. Advances on every commit and never moves back.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.commits.subscribe()
    }

    pub async fn append(
        &self,
        producer_id: impl Into<String>,
        sequence: u64,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> NodeResult<AppendOutcome> {
        let producer_id = producer_id.into();
        let log = Arc::clone(&self.inner.log);
        let start = Instant::now();
        let outcome =
            task::spawn_blocking(move || log.append(&producer_id, sequence, key, payload)).await??;
        metrics::histogram!(APPEND_DURATION, start.elapsed().as_secs_f64());

        match outcome {
            AppendOutcome::Committed(_) => {
                metrics::counter!(RECORDS_APPENDED, 1);
                let high_water = self.inner.log.high_water_offset();
                // Appends finishing out of order must not move the mark back.
                self.inner.commits.send_if_modified(|current| {
                    let advanced = high_water > *current;
                    if advanced {
                        *current = high_water;
                    }
                    advanced
                });
            }
            AppendOutcome::Duplicate(_) => {
                metrics::counter!(DUPLICATES, 1);
            }
        }
        Ok(outcome)
    }

    pub async fn read(&self, offset: u64) -> NodeResult<Record> {
        let log = Arc::clone(&self.inner.log);
        Ok(task::spawn_blocking(move || log.read(offset)).await??)
    }

    pub async fn read_batch(&self, start: u64, max_records: usize) -> NodeResult<Vec<Record>> {
        let log = Arc::clone(&self.inner.log);
        Ok(task::spawn_blocking(move || log.read_batch(start, max_records)).await??)
    }

    /// Records from `start` up to the first unreadable one. Only a failed
    /// blocking task is an error here; read failures come back in the batch.
    pub async fn read_prefix(&self, start: u64, max_records: usize) -> NodeResult<Batch> {
        let log = Arc::clone(&self.inner.log);
        Ok(task::spawn_blocking(move || log.read_prefix(start, max_records)).await?)
    }

    pub async fn acknowledge(&self, consumer: &str, offset: u64) -> NodeResult<bool> {
        let log = Arc::clone(&self.inner.log);
        let consumer = consumer.to_owned();
        Ok(task::spawn_blocking(move || log.acknowledge(&consumer, offset)).await??)
    }

    pub fn resume_point(&self, consumer: &str) -> u64 {
        self.inner.log.resume_point(consumer)
    }

    pub fn high_water_offset(&self) -> u64 {
        self.inner.log.high_water_offset()
    }

    pub async fn close(&self) -> NodeResult<()> {
        let log = Arc::clone(&self.inner.log);
        Ok(task::spawn_blocking(move || log.close()).await??)
    }
}
