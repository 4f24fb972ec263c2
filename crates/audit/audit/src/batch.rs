use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::AuditError;
use crate::record::AuthEvent;
use crate::sink::AuditSink;

/// Tuning for the batching writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// How often buffered events are flushed to the sink.
    pub flush_interval: Duration,
    /// Flush early once this many events are buffered.
    pub max_batch: usize,
    /// Bounded queue size between the request path and the writer task.
    pub queue_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            max_batch: 256,
            queue_capacity: 4096,
        }
    }
}

/// Decouples audit emission from the backend.
///
/// `emit` is non-blocking: events go onto a bounded queue and a background
/// task flushes them to the sink in batches. When the queue is full the
/// event is dropped and logged — an audit outage must never stall or fail
/// the request path.
pub struct BatchingAuditWriter {
    tx: mpsc::Sender<AuthEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BatchingAuditWriter {
    /// Spawn the writer task over `sink`.
    #[must_use]
    pub fn spawn(sink: Arc<dyn AuditSink>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(run_writer(sink, rx, config, shutdown.clone()));

        Self {
            tx,
            shutdown,
            tasks,
        }
    }

    /// Queue an event for the next batch. Never blocks.
    pub fn emit(&self, event: AuthEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event_id = %event.id, "audit queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event_id = %event.id, "audit writer closed, dropping event");
            }
        }
    }

    /// Flush remaining events and stop the writer task.
    ///
    /// Takes `&self` so the writer can be shut down through a shared
    /// handle; emits after shutdown are dropped with a log line.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn run_writer(
    sink: Arc<dyn AuditSink>,
    mut rx: mpsc::Receiver<AuthEvent>,
    config: WriterConfig,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<AuthEvent> = Vec::with_capacity(config.max_batch);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&sink, &mut buffer).await;
            }
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= config.max_batch {
                            flush(&sink, &mut buffer).await;
                        }
                    }
                    // Sender dropped: drain and exit.
                    None => break,
                }
            }
            () = shutdown.cancelled() => {
                // Drain whatever is still queued before exiting.
                while let Ok(event) = rx.try_recv() {
                    buffer.push(event);
                }
                break;
            }
        }
    }

    flush(&sink, &mut buffer).await;
    debug!("audit writer stopped");
}

async fn flush(sink: &Arc<dyn AuditSink>, buffer: &mut Vec<AuthEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    if let Err(e) = sink.append_batch(batch).await {
        // Logged, never propagated to the request path.
        warn!(error = %e, count, "audit batch write failed");
    } else {
        debug!(count, "audit batch written");
    }
}
