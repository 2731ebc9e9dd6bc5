//! Event sinks - where flushed batches land
//!
//! A sink accepts one whole batch per call and appends it in a single
//! operation, keeping per-tick I/O overhead bounded. Sinks choose their own
//! representation: [`StoreSink`] normalizes events into rows for a store,
//! [`JsonlSink`] and [`StdoutSink`] write one serialized object per line,
//! passing captured raw bytes through untouched.
//!
//! There is no partial-batch handling: when `append` fails, the caller
//! treats the whole batch as lost (at-most-once, recovered by replay).

use crate::store::EventStore;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use virta_core::{Event, EventRecord, Result, StreamError};

/// Sink trait - appends batches of events to a destination
///
/// Implementations must be `Send + Sync`; the flusher calls them from the
/// driving task only, but test harnesses share them across tasks.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Append a batch in one operation
    ///
    /// The batch is never empty; the flusher short-circuits empty drains.
    ///
    /// # Errors
    ///
    /// Any error means the whole batch was lost.
    async fn append(&self, events: &[Event]) -> Result<()>;

    /// Whether the destination is currently usable
    async fn health(&self) -> bool {
        true
    }
}

/// Sink that normalizes events into rows and bulk-inserts them into a store
pub struct StoreSink {
    store: Arc<dyn EventStore>,
}

impl StoreSink {
    /// Create a sink backed by the given store
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn append(&self, events: &[Event]) -> Result<()> {
        let records = events
            .iter()
            .map(EventRecord::from_event)
            .collect::<Result<Vec<_>>>()?;
        self.store.insert_batch(records).await
    }
}

/// Sink that appends one JSON object per line to a file
///
/// UTF-8, newline-terminated, append mode. Each batch becomes a single
/// multi-line write. Events carrying captured raw bytes are written back
/// byte for byte.
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    written: AtomicU64,
}

impl JsonlSink {
    /// Open (creating if needed) the file at `path` for appending
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            written: AtomicU64::new(0),
        })
    }

    /// The file this sink appends to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total events written since the sink was opened
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, events: &[Event]) -> Result<()> {
        let mut buf = BytesMut::new();
        for event in events {
            buf.put(event.raw_line()?);
            buf.put_u8(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;

        self.written
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Sink that writes one JSON object per line to stdout
///
/// Useful for piping a feed into other tooling and for demos.
pub struct StdoutSink {
    written: AtomicU64,
}

impl StdoutSink {
    /// Create a stdout sink
    pub fn new() -> Self {
        Self {
            written: AtomicU64::new(0),
        }
    }

    /// Total events written
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn append(&self, events: &[Event]) -> Result<()> {
        use std::io::Write;

        let mut buf = BytesMut::new();
        for event in events {
            buf.put(event.raw_line()?);
            buf.put_u8(b'\n');
        }

        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&buf)
            .map_err(|e| StreamError::Sink(format!("stdout write failed: {e}")))?;

        self.written
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory sink for tests
///
/// Records every batch it receives and can be told to fail.
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Event>>>,
    fail: AtomicBool,
}

impl MemorySink {
    /// Create an empty memory sink
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent `append` calls fail (or succeed again)
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of batches appended
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// All appended events, flattened in append order
    pub fn events(&self) -> Vec<Event> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, events: &[Event]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamError::Sink("intentional failure".into()));
        }
        self.batches.lock().push(events.to_vec());
        Ok(())
    }

    async fn health(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }
}
