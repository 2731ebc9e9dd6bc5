//! Replay - feed captured events through the live-processing path
//!
//! A [`ReplayStream`] substitutes for the live upstream: it reads recorded
//! events from a file on a task of its own and pushes them through the same
//! listener/queue path the live feed uses, so everything downstream is
//! agnostic to the origin. Useful for tests and for backfilling a store
//! from a capture at a controlled rate.
//!
//! Two framings are understood: pretty-printed object sequences (a record
//! opens at a line starting `{` and closes at a line starting `},`) and one
//! record per line. Anything that doesn't parse as a genuine post is
//! silently skipped - capture files are known to contain stray control
//! lines.

use crate::driver::{EventStream, Shutdown, pace};
use crate::listener::{FeedListener, QueueListener};
use crate::reconcile::Reconciler;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};
use virta_core::{Event, Result};

/// Log a progress line roughly this often, by bytes consumed
const BYTES_BETWEEN_PROGRESS: u64 = 40 * 1024 * 1024;

/// Upper bound on one rate-gate sleep, so waits stay interruptible
const GATE_SLEEP_STEP: Duration = Duration::from_millis(25);

/// How records are delimited in a capture file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Pretty-printed objects: `{` opens a record, a line starting `},`
    /// closes it, interior lines are kept verbatim
    Pretty,
    /// One JSON object per line, blank lines ignored
    Lines,
}

/// Accumulates lines into complete serialized records
struct RecordAssembler {
    framing: Framing,
    buf: String,
    in_record: bool,
}

impl RecordAssembler {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: String::new(),
            in_record: false,
        }
    }

    /// Feed one line; returns a complete record when one just closed
    fn feed(&mut self, line: &str) -> Option<String> {
        match self.framing {
            Framing::Lines => {
                let trimmed = line.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Framing::Pretty => {
                if line.starts_with('{') {
                    // new record; anything half-read is abandoned
                    self.in_record = true;
                    self.buf.clear();
                    self.buf.push_str(line);
                    self.buf.push('\n');
                    None
                } else if line.starts_with("},") && self.in_record {
                    self.buf.push('}');
                    self.in_record = false;
                    Some(std::mem::take(&mut self.buf))
                } else if self.in_record {
                    self.buf.push_str(line);
                    self.buf.push('\n');
                    None
                } else {
                    None
                }
            }
        }
    }
}

/// Paces forwarded records to a fixed events-per-second rate
///
/// Sleeps in small increments until `1/rate` seconds have passed since the
/// previous forwarded record, independent of how long parsing or downstream
/// processing took.
struct RateGate {
    min_gap: Duration,
    last: Option<tokio::time::Instant>,
}

impl RateGate {
    fn new(rate: f64) -> Self {
        Self {
            min_gap: Duration::from_secs_f64(1.0 / rate.max(f64::EPSILON)),
            last: None,
        }
    }

    async fn wait(&mut self) {
        let Some(last) = self.last else { return };
        loop {
            let elapsed = last.elapsed();
            if elapsed >= self.min_gap {
                return;
            }
            tokio::time::sleep((self.min_gap - elapsed).min(GATE_SLEEP_STEP)).await;
        }
    }

    fn stamp(&mut self) {
        self.last = Some(tokio::time::Instant::now());
    }
}

/// Position within a replay, rebuilt per run
#[derive(Debug, Clone, Default)]
pub struct ReplayCursor {
    /// Bytes consumed from the capture file
    pub bytes_read: u64,
    /// Lines consumed
    pub lines_read: u64,
    /// Genuine posts forwarded to the listener
    pub forwarded: u64,
    /// `created_at` of the last forwarded post
    pub last_created_at: Option<String>,
    /// Bytes consumed as of the last progress log line
    pub last_progress_bytes: u64,
}

/// File-backed substitute for the live upstream feed
///
/// The reader task, once started, cannot be restarted in place: a finished
/// replay leaves the slot occupied, and running the same capture again
/// means constructing a new `ReplayStream`.
pub struct ReplayStream {
    path: PathBuf,
    framing: Framing,
    rate_limit: Option<f64>,
    limit: Option<u64>,
    listener: Arc<QueueListener>,
    reconciler: Arc<dyn Reconciler>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cursor: Arc<RwLock<ReplayCursor>>,
}

impl ReplayStream {
    /// Create a replay over `path` feeding `listener`
    pub fn new(
        path: impl AsRef<Path>,
        framing: Framing,
        listener: Arc<QueueListener>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            framing,
            rate_limit: None,
            limit: None,
            listener,
            reconciler,
            reader: Mutex::new(None),
            cursor: Arc::new(RwLock::new(ReplayCursor::default())),
        }
    }

    /// Forward at most `rate` events per second
    pub fn rate_limit(mut self, rate: f64) -> Self {
        self.rate_limit = Some(rate);
        self
    }

    /// Stop after forwarding `limit` records
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Snapshot of the replay position
    pub fn cursor(&self) -> ReplayCursor {
        self.cursor.read().clone()
    }

    /// Whether the reader task has been started
    pub fn reader_started(&self) -> bool {
        self.reader.lock().is_some()
    }

    /// Whether the reader task has run to completion
    pub fn reader_finished(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Start the reader task if the slot is free
    ///
    /// Calling this while the slot is occupied - running or finished - is a
    /// no-op with a warning; replays are not restartable in place.
    pub fn start_reader(&self) {
        let mut slot = self.reader.lock();
        if slot.is_some() {
            warn!(
                path = %self.path.display(),
                "replay reader already started; recreate the stream to run it again"
            );
            return;
        }

        let task = ReaderTask {
            path: self.path.clone(),
            framing: self.framing,
            rate_limit: self.rate_limit,
            limit: self.limit,
            listener: self.listener.clone(),
            cursor: self.cursor.clone(),
        };
        *slot = Some(tokio::spawn(task.run()));
    }

    /// One tick: reconcile, and make sure the reader is running
    async fn update_stream(&self) -> Result<()> {
        if self.reconciler.check().await? && !self.reader_started() {
            self.start_reader();
        }
        Ok(())
    }
}

#[async_trait]
impl EventStream for ReplayStream {
    async fn start_polling(&mut self, interval: Duration, shutdown: &Shutdown) -> Result<()> {
        self.reconciler.reset();
        info!(path = %self.path.display(), "starting replay poll loop");

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            let loop_start = Instant::now();

            if let Err(err) = self.update_stream().await {
                break Err(err);
            }
            if let Some(err) = self.listener.take_fatal_error() {
                break Err(err);
            }

            let cursor = self.cursor();
            if let Some(through) = &cursor.last_created_at {
                info!(forwarded = cursor.forwarded, through = %through, "replayed events");
            }

            // the tick above flushed whatever the reader produced; once the
            // file is exhausted and the queue is dry, the session is done
            if self.reader_finished() && self.listener.queue().is_empty() {
                if let Some(err) = self.listener.take_fatal_error() {
                    break Err(err);
                }
                info!(forwarded = cursor.forwarded, "replay drained");
                break Ok(());
            }

            if !pace(interval, loop_start, shutdown).await {
                break Ok(());
            }
        };

        if shutdown.is_cancelled() {
            self.listener.request_termination();
        }
        warn!("replay poll ceased");
        result
    }
}

/// The reader side: runs on its own task, only ever touches the listener
struct ReaderTask {
    path: PathBuf,
    framing: Framing,
    rate_limit: Option<f64>,
    limit: Option<u64>,
    listener: Arc<QueueListener>,
    cursor: Arc<RwLock<ReplayCursor>>,
}

impl ReaderTask {
    async fn run(self) {
        info!(path = %self.path.display(), "replay reader started");
        match self.read_all().await {
            Ok(forwarded) => info!(forwarded, "replay reader finished"),
            Err(err) => self.listener.record_fatal_error(err),
        }
    }

    async fn read_all(&self) -> Result<u64> {
        let file = tokio::fs::File::open(&self.path).await?;
        let total_bytes = file.metadata().await?.len();
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut assembler = RecordAssembler::new(self.framing);
        let mut gate = self.rate_limit.map(RateGate::new);
        let mut forwarded = 0u64;

        while let Some(line) = lines.next_line().await? {
            {
                let mut cursor = self.cursor.write();
                cursor.bytes_read += line.len() as u64 + 1;
                cursor.lines_read += 1;
            }
            self.report_progress(total_bytes);

            let Some(raw) = assembler.feed(&line) else {
                continue;
            };
            let event = match Event::parse(&raw) {
                Ok(event) => event,
                Err(err) => {
                    // capture files carry partial and non-event lines
                    debug!(error = %err, "skipping unparseable record");
                    continue;
                }
            };
            if !event.is_post() {
                debug!("skipping non-post record");
                continue;
            }

            if let Some(gate) = &mut gate {
                gate.wait().await;
            }

            let created_at = event.created_at().map(str::to_owned);
            let keep_going = self.listener.on_event(event);
            if let Some(gate) = &mut gate {
                gate.stamp();
            }

            forwarded += 1;
            {
                let mut cursor = self.cursor.write();
                cursor.forwarded = forwarded;
                if created_at.is_some() {
                    cursor.last_created_at = created_at;
                }
            }

            if !keep_going {
                warn!("listener requested stop; ending replay");
                break;
            }
            if self.limit.is_some_and(|limit| forwarded >= limit) {
                info!(forwarded, "replay record limit reached");
                break;
            }
        }

        Ok(forwarded)
    }

    fn report_progress(&self, total_bytes: u64) {
        let mut cursor = self.cursor.write();
        if cursor.bytes_read - cursor.last_progress_bytes < BYTES_BETWEEN_PROGRESS {
            return;
        }
        cursor.last_progress_bytes = cursor.bytes_read;
        let percent = if total_bytes > 0 {
            cursor.bytes_read as f64 * 100.0 / total_bytes as f64
        } else {
            100.0
        };
        info!(
            percent,
            lines = cursor.lines_read,
            forwarded = cursor.forwarded,
            "replay progress"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::flush::BatchFlusher;
    use crate::process::{MemoryProcessRegistry, ProcessHandle};
    use crate::queue::EventQueue;
    use crate::reconcile::ReplayReconciler;
    use crate::sink::MemorySink;
    use std::io::Write;

    // ========================================================================
    // Framing
    // ========================================================================

    #[test]
    fn pretty_framing_assembles_delimited_records() {
        let mut assembler = RecordAssembler::new(Framing::Pretty);
        let input = "{\n\"a\":1\n},\n{\n\"a\":2\n},\n";

        let records: Vec<String> = input
            .lines()
            .filter_map(|line| assembler.feed(line))
            .collect();

        assert_eq!(records.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&records[1]).unwrap();
        assert_eq!(first, serde_json::json!({"a": 1}));
        assert_eq!(second, serde_json::json!({"a": 2}));
    }

    #[test]
    fn pretty_framing_tolerates_interior_whitespace() {
        let mut assembler = RecordAssembler::new(Framing::Pretty);
        let input = "{\n    \"a\": 1,\n\n      \"b\": [1,\n    2]\n},\n";

        let records: Vec<String> = input
            .lines()
            .filter_map(|line| assembler.feed(line))
            .collect();

        assert_eq!(records.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn pretty_framing_ignores_lines_between_records() {
        let mut assembler = RecordAssembler::new(Framing::Pretty);
        let input = "garbage header\n},\n{\n\"a\":1\n},\ntrailing noise\n";

        let records: Vec<String> = input
            .lines()
            .filter_map(|line| assembler.feed(line))
            .collect();

        assert_eq!(records.len(), 1);
    }

    #[test]
    fn line_framing_skips_blanks() {
        let mut assembler = RecordAssembler::new(Framing::Lines);
        let input = "{\"a\":1}\n\n{\"a\":2}\n   \n";

        let records: Vec<String> = input
            .lines()
            .filter_map(|line| assembler.feed(line))
            .collect();

        assert_eq!(records, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    // ========================================================================
    // Reader task
    // ========================================================================

    fn post_line(id: i64) -> String {
        format!(
            r#"{{"id": {id}, "text": "post {id}", "created_at": "Sat Sep 22 22:06:{:02} +0000 2012", "user": {{"id": 1, "screen_name": "a", "name": "A"}}}}"#,
            id % 60
        )
    }

    fn write_capture(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    async fn fixture() -> (Arc<EventQueue>, Arc<QueueListener>, Arc<ReplayReconciler>) {
        let queue = Arc::new(EventQueue::new());
        let listener = Arc::new(QueueListener::new(queue.clone()));
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(MemoryProcessRegistry::new());
        let process = ProcessHandle::register(registry, 30, false).await.unwrap();
        let flusher = BatchFlusher::new(queue.clone(), sink, false);
        let reconciler = Arc::new(ReplayReconciler::new(flusher, process, 5));
        (queue, listener, reconciler)
    }

    async fn wait_for_reader(stream: &ReplayStream) {
        while !stream.reader_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn reader_forwards_posts_and_skips_control_lines() {
        let lines = vec![
            post_line(1),
            r#"{"limit": {"track": 12}}"#.to_string(),
            "not json at all".to_string(),
            post_line(2),
        ];
        let capture = write_capture(&lines);
        let (queue, listener, reconciler) = fixture().await;

        let stream = ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler);
        stream.start_reader();
        wait_for_reader(&stream).await;

        let batch = queue.drain_all_nowait();
        let ids: Vec<_> = batch.iter().map(|e| e.event_id().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);

        let cursor = stream.cursor();
        assert_eq!(cursor.forwarded, 2);
        assert_eq!(cursor.lines_read, 4);
        assert!(cursor.last_created_at.is_some());
    }

    #[tokio::test]
    async fn reader_honors_record_limit() {
        let lines: Vec<String> = (0..20).map(post_line).collect();
        let capture = write_capture(&lines);
        let (queue, listener, reconciler) = fixture().await;

        let stream =
            ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler).limit(7);
        stream.start_reader();
        wait_for_reader(&stream).await;

        assert_eq!(queue.len(), 7);
        assert_eq!(stream.cursor().forwarded, 7);
    }

    #[tokio::test]
    async fn reader_stops_when_listener_declines() {
        let lines: Vec<String> = (0..50).map(post_line).collect();
        let capture = write_capture(&lines);
        let (queue, listener, reconciler) = fixture().await;

        listener.request_termination();
        let stream =
            ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler);
        stream.start_reader();
        wait_for_reader(&stream).await;

        // the declined event is still enqueued; nothing follows it
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_lands_in_fatal_mailbox() {
        let (_queue, listener, reconciler) = fixture().await;

        let stream = ReplayStream::new(
            "/nonexistent/capture.json",
            Framing::Lines,
            listener.clone(),
            reconciler,
        );
        stream.start_reader();
        wait_for_reader(&stream).await;

        assert!(listener.take_fatal_error().is_some());
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let lines: Vec<String> = (0..3).map(post_line).collect();
        let capture = write_capture(&lines);
        let (queue, listener, reconciler) = fixture().await;

        let stream = ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler);
        stream.start_reader();
        wait_for_reader(&stream).await;
        assert_eq!(queue.len(), 3);

        // the slot stays occupied; no second pass over the file
        stream.start_reader();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_bounds_forwarding_speed() {
        let lines: Vec<String> = (0..30).map(post_line).collect();
        let capture = write_capture(&lines);
        let (queue, listener, reconciler) = fixture().await;

        let stream = ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler)
            .rate_limit(10.0);
        let started = tokio::time::Instant::now();
        stream.start_reader();
        wait_for_reader(&stream).await;

        // 30 records at 10/s: 29 inter-record gaps of 100ms
        assert!(
            started.elapsed() >= Duration::from_millis(2900),
            "rate gate finished too fast: {:?}",
            started.elapsed()
        );
        assert_eq!(queue.len(), 30);
    }

    // ========================================================================
    // Poll loop
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn start_polling_runs_replay_to_completion() {
        let lines: Vec<String> = (0..10).map(post_line).collect();
        let capture = write_capture(&lines);

        let queue = Arc::new(EventQueue::new());
        let listener = Arc::new(QueueListener::new(queue.clone()));
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(MemoryProcessRegistry::new());
        let process = ProcessHandle::register(registry.clone(), 30, false)
            .await
            .unwrap();
        let flusher = BatchFlusher::new(queue.clone(), sink.clone(), false);
        let reconciler = Arc::new(ReplayReconciler::new(flusher, process, 5));

        let mut stream =
            ReplayStream::new(capture.path(), Framing::Lines, listener, reconciler);
        let shutdown = Shutdown::new();

        stream
            .start_polling(Duration::from_millis(200), &shutdown)
            .await
            .unwrap();

        assert_eq!(sink.events().len(), 10, "flushed through the sink");
        assert!(queue.is_empty());
        assert!(registry.all()[0].last_heartbeat >= registry.all()[0].created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn start_polling_surfaces_reader_errors() {
        let queue = Arc::new(EventQueue::new());
        let listener = Arc::new(QueueListener::new(queue.clone()));
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(MemoryProcessRegistry::new());
        let process = ProcessHandle::register(registry, 30, false).await.unwrap();
        let flusher = BatchFlusher::new(queue, sink, false);
        let reconciler = Arc::new(ReplayReconciler::new(flusher, process, 5));

        let mut stream = ReplayStream::new(
            "/nonexistent/capture.json",
            Framing::Lines,
            listener,
            reconciler,
        );
        let shutdown = Shutdown::new();

        let result = stream
            .start_polling(Duration::from_millis(200), &shutdown)
            .await;
        assert!(result.is_err());
    }
}
