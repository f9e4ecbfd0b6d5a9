//! Asynchronous JSONL event log.
//!
//! [`EventLog::record`] only appends to an in-memory queue and returns; it
//! never waits on I/O.  A background flush drains the queue in batches of up
//! to [`LOG_BATCH_SIZE`] entries, one write per batch, with at most one write
//! in flight.  Entries that arrive during a write are picked up by the next
//! round.  [`EventLog::shutdown`] drains whatever is left before closing the
//! sink, so a clean exit loses nothing.
//!
//! Write failures are counted and reported through `tracing`; they never
//! reach the caller.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use zip_types::{LogEntry, LogEvent};

/// Most entries written per flush round.
pub const LOG_BATCH_SIZE: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Destination of serialised batches.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append `payload` (one or more complete JSON lines).
    async fn write(&self, payload: &str) -> std::io::Result<()>;

    /// Flush and release the underlying resource.
    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Append-only file sink.
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn write(&self, payload: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::other("event log closed"))?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await
    }

    async fn close(&self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Discards everything.  Used when no log file is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn write(&self, _payload: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// In-memory sink that keeps every batch.  Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    write_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each write take `delay` (Tokio time).
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw payload of every successful write.
    pub fn batches(&self) -> Vec<String> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Every entry written, in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.batches()
            .iter()
            .flat_map(|b| b.lines().map(str::to_owned).collect::<Vec<_>>())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent writes observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn write(&self, payload: &str) -> std::io::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full"));
        }
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(payload.to_string());
        Ok(())
    }

    async fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventLog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LogQueue {
    entries: VecDeque<LogEntry>,
    flushing: bool,
    closed: bool,
}

struct Inner {
    sink: Arc<dyn LogSink>,
    queue: Mutex<LogQueue>,
    write_gate: tokio::sync::Mutex<()>,
    batches: AtomicU64,
    written: AtomicU64,
    write_errors: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, LogQueue> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_batch(&self) -> Vec<LogEntry> {
        let mut queue = self.queue();
        let n = queue.entries.len().min(LOG_BATCH_SIZE);
        queue.entries.drain(..n).collect()
    }

    async fn flush_loop(self: Arc<Self>) {
        loop {
            let _gate = self.write_gate.lock().await;
            let batch = self.take_batch();
            if batch.is_empty() {
                // Recheck under the queue lock so a concurrent `record` that
                // saw `flushing` set is not stranded.
                let mut queue = self.queue();
                if queue.entries.is_empty() {
                    queue.flushing = false;
                    return;
                }
                continue;
            }
            self.write_batch(batch).await;
        }
    }

    async fn write_batch(&self, batch: Vec<LogEntry>) {
        let mut payload = String::new();
        let mut count = 0u64;
        for entry in &batch {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    payload.push_str(&line);
                    payload.push('\n');
                    count += 1;
                }
                Err(e) => {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "event log entry not serialisable");
                }
            }
        }
        if count == 0 {
            return;
        }
        match self.sink.write(&payload).await {
            Ok(()) => {
                self.batches.fetch_add(1, Ordering::Relaxed);
                self.written.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, lost = count, "event log write failed");
            }
        }
    }
}

/// Handle to the event log.  Clones share one queue and sink.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                queue: Mutex::new(LogQueue::default()),
                write_gate: tokio::sync::Mutex::new(()),
                batches: AtomicU64::new(0),
                written: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Log to a JSONL file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(Arc::new(FileSink::open(path).await?)))
    }

    /// Queue `event`.  Never blocks on I/O and never fails.
    ///
    /// Outside a Tokio runtime the entry stays queued until the next flush
    /// or [`EventLog::shutdown`].
    pub fn record(&self, event: LogEvent, data: Option<Value>) {
        let entry = LogEntry::new(event, data);
        let mut queue = self.inner.queue();
        if queue.closed {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(?event, "event log closed, entry dropped");
            return;
        }
        queue.entries.push_back(entry);
        if queue.flushing {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            queue.flushing = true;
            drop(queue);
            runtime.spawn(Arc::clone(&self.inner).flush_loop());
        }
    }

    /// Stop accepting entries, write out everything queued, then close the
    /// sink.
    pub async fn shutdown(&self) {
        self.inner.queue().closed = true;
        let _gate = self.inner.write_gate.lock().await;
        loop {
            let batch = self.inner.take_batch();
            if batch.is_empty() {
                break;
            }
            self.inner.write_batch(batch).await;
        }
        if let Err(e) = self.inner.sink.close().await {
            self.inner.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "event log close failed");
        }
    }

    /// Entries waiting to be written.
    pub fn pending(&self) -> usize {
        self.inner.queue().entries.len()
    }

    /// Successful write rounds.
    pub fn batches_written(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    pub fn entries_written(&self) -> u64 {
        self.inner.written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.inner.write_errors.load(Ordering::Relaxed)
    }

    /// Entries recorded after shutdown.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
