// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Connector runtime.
//!
//! Each registered sink gets its own task that walks the log from the sink's
//! resume point. A record is acknowledged only after the sink Acks it; a Nack
//! redelivers the same record after the retry backoff, so nothing is ever
//! skipped. Caught-up tasks sleep on the commit channel.
//!
//! Shutdown is cooperative: a delivery already in progress runs to
//! completion, then the task exits. An interrupted retry loop leaves the
//! record unacknowledged and it is delivered again on the next start.

use crate::config::NodeConfig;
use crate::connector::{Delivery, Sink};
use crate::errors::{NodeError, NodeResult};
use crate::source::EventSource;
use crate::telemetry::{DELIVERIES, DELIVERY_NACKS};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub batch_size: usize,
    pub retry_backoff: Duration,
    pub idle_poll_interval: Duration,
}

impl From<&NodeConfig> for DeliverySettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            batch_size: config.delivery_batch_size.max(1),
            retry_backoff: config.retry_backoff(),
            idle_poll_interval: config.idle_poll_interval(),
        }
    }
}

pub struct ConnectorRuntime {
    source: EventSource,
    settings: DeliverySettings,
    shutdown_tx: watch::Sender<bool>,
    accepting: AtomicBool,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectorRuntime {
    pub fn new(source: EventSource, settings: DeliverySettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            settings,
            shutdown_tx,
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Start delivering to `sink` from its resume point.
    pub async fn register(&self, sink: Arc<dyn Sink>) -> NodeResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !self.accepting.load(Ordering::Acquire) {
            return Err(NodeError::ShuttingDown);
        }
        let name = sink.name().to_owned();
        if tasks.contains_key(&name) {
            return Err(NodeError::AlreadyRegistered(name));
        }

        let worker = Worker {
            source: self.source.clone(),
            sink,
            settings: self.settings,
            shutdown: self.shutdown_tx.subscribe(),
        };
        tasks.insert(name.clone(), tokio::spawn(worker.run()));
        info!(sink = %name, "registered sink");
        Ok(())
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop accepting sinks, signal every task, and wait for all of them.
    pub async fn shutdown(&self) -> NodeResult<()> {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            self.accepting.store(false, Ordering::Release);
            tasks.drain().collect()
        };
        self.shutdown_tx.send_replace(true);
        info!(connectors = handles.len(), "shutting down connector runtime");

        let (names, joins): (Vec<String>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let mut first_error = None;
        for (name, result) in names.into_iter().zip(join_all(joins).await) {
            if let Err(e) = result {
                error!(sink = %name, error = %e, "connector task failed");
                first_error.get_or_insert(NodeError::Join(e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Worker {
    source: EventSource,
    sink: Arc<dyn Sink>,
    settings: DeliverySettings,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`. Returns true if shutdown was signalled meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.stopping() {
            return true;
        }
        let signalled = tokio::select! {
            _ = self.shutdown.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        signalled || self.stopping()
    }

    async fn run(mut self) {
        let name = self.sink.name().to_owned();
        let mut commits = self.source.subscribe();
        let mut cursor = self.source.resume_point(&name);
        info!(sink = %name, cursor, "connector started");

        'deliver: while !self.stopping() {
            // Mark the current high-water as seen before reading, so a commit
            // landing after the read still wakes the idle wait below.
            commits.borrow_and_update();

            let batch = match self.source.read_prefix(cursor, self.settings.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(sink = %name, cursor, error = %e, "read task failed, retrying");
                    if self.pause(self.settings.retry_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                // Records before an unreadable one were already delivered, so
                // the failure is always at the cursor by the time it lands here.
                if let Some(e) = &batch.error {
                    warn!(sink = %name, cursor, error = %e, "read failed, retrying");
                    if self.pause(self.settings.retry_backoff).await {
                        break;
                    }
                    continue;
                }
                let mut source_gone = false;
                tokio::select! {
                    _ = self.shutdown.changed() => break,
                    changed = commits.changed() => source_gone = changed.is_err(),
                    _ = tokio::time::sleep(self.settings.idle_poll_interval) => {}
                }
                if source_gone && self.pause(self.settings.idle_poll_interval).await {
                    break;
                }
                continue;
            }

            for record in batch.records {
                let mut attempts = 1u32;
                loop {
                    match self.sink.deliver(&record).await {
                        Delivery::Ack => break,
                        Delivery::Nack(reason) => {
                            metrics::counter!(DELIVERY_NACKS, 1);
                            warn!(
                                sink = %name,
                                offset = record.offset,
                                attempts,
                                reason = %reason,
                                "sink rejected record, retrying"
                            );
                            attempts += 1;
                            if self.pause(self.settings.retry_backoff).await {
                                break 'deliver;
                            }
                        }
                    }
                }

                metrics::counter!(DELIVERIES, 1);
                if let Err(e) = self.source.acknowledge(&name, record.offset).await {
                    warn!(sink = %name, offset = record.offset, error = %e, "failed to persist acknowledgement");
                }
                debug!(sink = %name, offset = record.offset, "delivered");
                cursor = record.offset + 1;

                if self.stopping() {
                    break 'deliver;
                }
            }
        }

        info!(sink = %name, cursor, "connector stopped");
    }
}
