// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batched persistence of worker output.
//!
//! Every supervised process pushes its stdout/stderr lines onto one bounded
//! [`LogQueue`]. A single [`LogBatcher`] drains it and hands batches to a
//! [`LogSink`]: the store on the master, [`MasterLogForwarder`] on agents.
//!
//! A batch is flushed when it reaches `batch_size` records, or when no record
//! arrived for `idle_timeout` while the batch is non-empty. Delivery is
//! at-most-once: a failed insert is logged and the batch dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use edgehost_agent_sdk::{AgentClient, LogStream, WorkerLogRecord};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::store::LogSink;

/// Configuration for the log batcher.
#[derive(Debug, Clone)]
pub struct LogBatcherConfig {
    /// Capacity of the queue between the supervisor and the batcher.
    pub capacity: usize,
    /// Records per flush.
    pub batch_size: usize,
    /// Idle time after which a partial batch is flushed.
    pub idle_timeout: Duration,
}

impl Default for LogBatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size: 100,
            idle_timeout: Duration::from_secs(2),
        }
    }
}

/// Producer side of the log queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LogQueue {
    tx: mpsc::Sender<WorkerLogRecord>,
}

impl LogQueue {
    /// Queue a record, waiting for room when the queue is full.
    ///
    /// Returns `false` once the batcher has gone away.
    pub async fn push(&self, record: WorkerLogRecord) -> bool {
        self.tx.send(record).await.is_ok()
    }

    /// Queue one line read from a worker stream.
    pub async fn push_line(&self, worker_uid: &str, output: String, stream: LogStream) -> bool {
        self.push(WorkerLogRecord {
            uid: Uuid::new_v4().to_string(),
            worker_uid: worker_uid.to_string(),
            output,
            stream,
            time: Utc::now(),
        })
        .await
    }
}

/// Single consumer of the log queue.
pub struct LogBatcher {
    rx: mpsc::Receiver<WorkerLogRecord>,
    sink: Arc<dyn LogSink>,
    config: LogBatcherConfig,
    shutdown: Arc<Notify>,
}

impl LogBatcher {
    /// Create the queue and its batcher.
    pub fn new(config: LogBatcherConfig, sink: Arc<dyn LogSink>) -> (LogQueue, Self) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        (
            LogQueue { tx },
            Self {
                rx,
                sink,
                config,
                shutdown: Arc::new(Notify::new()),
            },
        )
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the batcher loop until shutdown or until every producer is dropped.
    ///
    /// Records still queued at shutdown are flushed before returning.
    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "Log batcher started"
        );

        let mut batch: Vec<WorkerLogRecord> = Vec::with_capacity(self.config.batch_size);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Log batcher received shutdown signal");
                    while let Ok(record) = self.rx.try_recv() {
                        batch.push(record);
                    }
                    self.flush(&mut batch).await;
                    break;
                }

                received = tokio::time::timeout(self.config.idle_timeout, self.rx.recv()) => {
                    match received {
                        Ok(Some(record)) => {
                            batch.push(record);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        Ok(None) => {
                            self.flush(&mut batch).await;
                            break;
                        }
                        Err(_) => {
                            if !batch.is_empty() {
                                self.flush(&mut batch).await;
                            }
                        }
                    }
                }
            }
        }

        info!("Log batcher stopped");
    }

    async fn flush(&self, batch: &mut Vec<WorkerLogRecord>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        match self.sink.insert_logs(&records).await {
            Ok(()) => debug!(count = records.len(), "Flushed worker logs"),
            Err(e) => error!(count = records.len(), error = %e, "Failed to insert worker logs, dropping batch"),
        }
    }
}

/// Sink forwarding batches to the master's `/agent/logs`.
pub struct MasterLogForwarder {
    client: AgentClient,
    master: String,
}

impl MasterLogForwarder {
    /// Forward to `master` with `client`.
    pub fn new(client: AgentClient, master: impl Into<String>) -> Self {
        Self {
            client,
            master: master.into(),
        }
    }
}

#[async_trait]
impl LogSink for MasterLogForwarder {
    async fn insert_logs(&self, logs: &[WorkerLogRecord]) -> Result<()> {
        self.client.push_logs(&self.master, logs).await?;
        Ok(())
    }
}
