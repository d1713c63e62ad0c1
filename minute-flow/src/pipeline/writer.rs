//! Dual-trigger batch writer.
//!
//! The single consumer of the aggregate queue. Documents are buffered and flushed to the
//! [`AggregateSink`] whenever the buffer reaches `batch_size` or `flush_interval` has elapsed
//! since the last flush with a non-empty buffer, whichever happens first. Cancelling the
//! writer drains everything still queued and performs one final flush.
//!
//! A failed flush is not retried: the batch is dropped, logged, and reported to the operator
//! as a dead letter.

use crate::{
    aggregate::AggregateDocument,
    notify::{Notifier, notify_best_effort},
    pipeline::queue::QueueReceiver,
    sink::AggregateSink,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Batch writer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Flush as soon as this many documents are buffered.
    pub batch_size: usize,
    /// Flush a non-empty buffer once this long has passed since the last flush.
    pub flush_interval: Duration,
    /// How long to wait for the next queued document before re-checking the flush timer.
    pub poll_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 2_000,
            flush_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl WriterConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

/// Counters shared between a running writer and its [`WriterHandle`].
#[derive(Debug, Default)]
pub struct WriterStats {
    buffered: AtomicUsize,
    persisted: AtomicU64,
    dead_lettered: AtomicU64,
    flushes: AtomicU64,
}

impl WriterStats {
    /// Documents received from the queue but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Documents dropped by failed flushes.
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Flush attempts with a non-empty buffer, successful or not.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

pub struct BatchWriter {
    config: WriterConfig,
    receiver: QueueReceiver,
    sink: Arc<dyn AggregateSink>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<WriterStats>,
    flush_request: Arc<Notify>,
}

/// Owning handle of a spawned [`BatchWriter`].
#[derive(Debug)]
pub struct WriterHandle {
    cancel: CancellationToken,
    control: WriterControl,
    task: JoinHandle<()>,
}

/// Cloneable flush trigger and counters of a running writer.
#[derive(Debug, Clone)]
pub struct WriterControl {
    stats: Arc<WriterStats>,
    flush_request: Arc<Notify>,
}

impl WriterControl {
    /// Request an immediate flush of whatever is buffered.
    pub fn flush(&self) {
        self.flush_request.notify_one();
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

impl WriterHandle {
    pub fn flush(&self) {
        self.control.flush();
    }

    pub fn stats(&self) -> &WriterStats {
        self.control.stats()
    }

    pub fn control(&self) -> WriterControl {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the writer to drain and flush without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the writer and wait for its final drain-and-flush to complete.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            error!(%error, "batch writer task failed");
        }
    }
}

impl BatchWriter {
    pub fn new(
        config: WriterConfig,
        receiver: QueueReceiver,
        sink: Arc<dyn AggregateSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            receiver,
            sink,
            notifier,
            stats: Arc::new(WriterStats::default()),
            flush_request: Arc::new(Notify::new()),
        }
    }

    /// Spawn the consumer loop. It stops when `cancel` fires or every sender is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> WriterHandle {
        let control = WriterControl {
            stats: Arc::clone(&self.stats),
            flush_request: Arc::clone(&self.flush_request),
        };
        let task = tokio::spawn(self.run(cancel.clone()));

        WriterHandle {
            cancel,
            control,
            task,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "batch writer started"
        );

        let mut buffer = Vec::with_capacity(self.config.batch_size);
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = self.flush_request.notified() => {
                    debug!(buffered = buffer.len(), "operator requested flush");
                    self.flush(&mut buffer).await;
                    last_flush = Instant::now();
                    continue;
                }

                next = tokio::time::timeout(self.config.poll_timeout, self.receiver.recv()) => {
                    match next {
                        Ok(Some(document)) => {
                            buffer.push(document);
                            self.stats.buffered.store(buffer.len(), Ordering::Relaxed);
                        }
                        Ok(None) => {
                            debug!("aggregate queue closed");
                            break;
                        }
                        // Poll timeout elapsed with no new document
                        Err(_) => {}
                    }
                }
            }

            let full = buffer.len() >= self.config.batch_size;
            let due = !buffer.is_empty() && last_flush.elapsed() >= self.config.flush_interval;
            if full || due {
                self.flush(&mut buffer).await;
                last_flush = Instant::now();
            }
        }

        while let Some(document) = self.receiver.try_recv() {
            buffer.push(document);
        }
        let remaining = buffer.len();
        self.flush(&mut buffer).await;

        info!(
            final_flush = remaining,
            persisted = self.stats.persisted(),
            dead_lettered = self.stats.dead_lettered(),
            "batch writer stopped"
        );
    }

    async fn flush(&self, buffer: &mut Vec<AggregateDocument>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        match self.sink.insert_many(buffer).await {
            Ok(()) => {
                self.stats
                    .persisted
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, "flushed aggregate batch");
            }
            Err(error) => {
                self.stats
                    .dead_lettered
                    .fetch_add(count as u64, Ordering::Relaxed);
                error!(count, %error, "failed to persist aggregate batch, dropping it");
                notify_best_effort(
                    self.notifier.as_ref(),
                    &format!("[Writer] Dead letter: {count} documents dropped after failed insert: {error}"),
                )
                .await;
            }
        }

        buffer.clear();
        self.stats.buffered.store(0, Ordering::Relaxed);
    }
}
