use crate::error::StorageError;
use crate::ingest::AverageRecord;
use crate::storage::AverageStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub enum BatchCommand {
    Record(AverageRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub async fn enqueue(&self, record: AverageRecord) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(
            queue_depth,
            event = record.event_name(),
            greenhouse_id = record.greenhouse_id(),
            node_id = ?record.node_id(),
            "queued average"
        );
        if let Err(err) = self.tx.send(BatchCommand::Record(record)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decode_failures: AtomicU64,
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_micros: self.average_flush_micros.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }

    /// Emitted once per aggregation tick.
    pub fn log_progress(&self) {
        let snap = self.snapshot();
        tracing::info!(
            mqtt_connected = snap.mqtt_connected,
            frames_received = snap.frames_received,
            frames_dropped = snap.frames_dropped,
            decode_failures = snap.decode_failures,
            queue_depth = snap.queue_depth,
            last_batch_len = snap.last_batch_len,
            last_flush_unix_ms = snap.last_flush_unix_ms,
            batches_flushed = snap.batches_flushed,
            batches_dropped = snap.batches_dropped,
            last_error = snap.last_error.as_deref().unwrap_or("none"),
            "ingest progress"
        );
    }

    pub fn log_summary(&self) {
        let snap = self.snapshot();
        tracing::info!(
            frames_received = snap.frames_received,
            frames_dropped = snap.frames_dropped,
            decode_failures = snap.decode_failures,
            batches_flushed = snap.batches_flushed,
            batches_dropped = snap.batches_dropped,
            average_flush_micros = snap.average_flush_micros,
            last_error = snap.last_error.as_deref().unwrap_or("none"),
            "ingest totals"
        );
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub decode_failures: u64,
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub batches_flushed: u64,
    pub batches_dropped: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

/// Buffers records and writes them through `store` when `batch_size` is
/// reached, when `flush_interval` passes without a flush, on demand, and once
/// more when every handle is dropped.
pub fn spawn_worker<S: AverageStore>(
    store: S,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    let batch_size = batch_size.max(1);
    tokio::spawn(async move {
        let mut buffer: Vec<AverageRecord> = Vec::with_capacity(batch_size);
        // The first deadline is one interval out, not immediate.
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if buffer.is_empty() {
                        continue;
                    }
                    if let Err(err) = flush(&store, &mut buffer, &stats).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                    ticker.reset();
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Record(record)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(record);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(&store, &mut buffer, &stats).await {
                                    tracing::warn!(error=%err, "flush on batch size failed");
                                }
                                ticker.reset();
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            if !buffer.is_empty() {
                                if let Err(err) = flush(&store, &mut buffer, &stats).await {
                                    tracing::warn!(error=%err, "flush on demand failed");
                                }
                                ticker.reset();
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(&store, &mut buffer, &stats).await {
                                tracing::warn!(error=%err, "flush during shutdown failed");
                            }
                            tracing::info!("storage worker stopped");
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Writes the buffer as one transaction, retrying once. A batch that fails
/// twice is discarded so the worker keeps pace with the aggregator.
async fn flush<S: AverageStore>(
    store: &S,
    buffer: &mut Vec<AverageRecord>,
    stats: &Arc<IngestStats>,
) -> Result<(), StorageError> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let items = std::mem::take(buffer);
    let len = items.len();

    let result = match store.write_batch(&items).await {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error=%err, len, "batch write failed; retrying once");
            store.write_batch(&items).await
        }
    };

    match result {
        Ok(()) => {
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, micros, "flushed averages batch");
            Ok(())
        }
        Err(err) => {
            stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(
                error=%err,
                len,
                "dropping averages batch after retry; accepting bounded data loss to keep ingest moving"
            );
            Err(err)
        }
    }
}
