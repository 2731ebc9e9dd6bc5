//! Driving loop - polling, subscription restarts and retries
//!
//! The driving task owns everything that is not the receiving task: it ticks
//! the reconciler, restarts the upstream subscription when the term set
//! changes, re-raises fatal errors captured on the receiving task, and
//! self-paces so a slow tick doesn't stretch the cadence.
//!
//! Cancellation is cooperative: a [`Shutdown`] token is checked at every
//! iteration boundary and interrupts the interval wait immediately, instead
//! of signal handlers mutating shared state.

use crate::config::StreamConfig;
use crate::listener::{FeedListener, QueueListener};
use crate::reconcile::Reconciler;
use crate::terms::TermSet;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use virta_core::{Result, StreamError};

/// Cooperative cancellation token
///
/// Cloneable; all clones observe the same cancellation. Cancelling is
/// idempotent and never blocks.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation, waking every pending [`cancelled`](Self::cancelled) wait
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A running upstream subscription
///
/// Dropping one without calling [`disconnect`](Self::disconnect) is allowed
/// but implementations should treat drop as a disconnect too.
pub trait Subscription: Send {
    /// Tear the connection down promptly
    fn disconnect(&mut self);
}

/// External feed transport - the only party doing upstream network I/O
///
/// Contract: deliver decoded events through the listener from a task of the
/// client's own, honor a `false` return from
/// [`FeedListener::on_event`] by closing the connection, and surface
/// transport failures through [`FeedListener::record_fatal_error`] rather
/// than panicking.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Open a subscription delivering events matching `terms`
    async fn subscribe(
        &self,
        terms: &TermSet,
        listener: Arc<dyn FeedListener>,
    ) -> Result<Box<dyn Subscription>>;
}

/// One polling session over an upstream source
///
/// Implemented by [`LiveStream`] and [`crate::replay::ReplayStream`] so the
/// retry loop and tests exercise identical control logic for both.
#[async_trait]
pub trait EventStream: Send {
    /// Run the poll loop until shutdown or a fatal error
    async fn start_polling(&mut self, interval: Duration, shutdown: &Shutdown) -> Result<()>;
}

/// Live-feed driver: poll, restart subscription on term changes
pub struct LiveStream {
    client: Arc<dyn FeedClient>,
    listener: Arc<QueueListener>,
    reconciler: Arc<dyn Reconciler>,
    subscription: Option<Box<dyn Subscription>>,
}

impl LiveStream {
    /// Create a driver over the given transport, listener and reconciler
    pub fn new(
        client: Arc<dyn FeedClient>,
        listener: Arc<QueueListener>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            client,
            listener,
            reconciler,
            subscription: None,
        }
    }

    /// Whether a subscription is currently open
    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    /// Tear down the current subscription, if any
    pub fn disconnect(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            debug!("disconnecting upstream subscription");
            subscription.disconnect();
        }
    }

    /// One tick: reconcile, and restart the subscription on a term change
    async fn update_subscription(&mut self) -> Result<()> {
        if !self.reconciler.check().await? {
            return Ok(());
        }

        let terms = self.reconciler.terms();
        self.disconnect();

        if terms.is_empty() {
            info!("no enabled terms; leaving upstream idle");
            return Ok(());
        }

        info!(count = terms.len(), "restarting upstream subscription");
        let listener: Arc<dyn FeedListener> = self.listener.clone();
        self.subscription = Some(self.client.subscribe(&terms, listener).await?);
        Ok(())
    }
}

#[async_trait]
impl EventStream for LiveStream {
    async fn start_polling(&mut self, interval: Duration, shutdown: &Shutdown) -> Result<()> {
        self.reconciler.reset();
        info!(interval_secs = interval.as_secs_f64(), "starting term poll loop");

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            let loop_start = Instant::now();

            if let Err(err) = self.update_subscription().await {
                break Err(err);
            }
            // Re-raise anything the receiving task captured, on this task,
            // so the outer retry loop decides what happens next.
            if let Some(err) = self.listener.take_fatal_error() {
                break Err(err);
            }

            if !pace(interval, loop_start, shutdown).await {
                break Ok(());
            }
        };

        if shutdown.is_cancelled() {
            self.listener.request_termination();
        }
        self.disconnect();
        warn!("term poll ceased");
        result
    }
}

/// Shutdown-aware self-pacing wait
///
/// Sleeps for `max(0.1s, interval - elapsed)` so the loop keeps its cadence
/// even when reconciliation work ate part of the interval. Returns `false`
/// when cancellation interrupted the wait.
pub(crate) async fn pace(interval: Duration, loop_start: Instant, shutdown: &Shutdown) -> bool {
    let wait = interval
        .saturating_sub(loop_start.elapsed())
        .max(Duration::from_millis(100));
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Outer retry loop shared by live and replay modes
///
/// Runs polling sessions until one ends gracefully, counting failures
/// through the reconciler and backing off one second between attempts. Once
/// the error ceiling is reached the loop gives up - unless `prevent_exit`
/// is set, in which case the budget is cleared and retries continue
/// indefinitely.
pub async fn run_stream<S: EventStream + ?Sized>(
    stream: &mut S,
    reconciler: &dyn Reconciler,
    config: &StreamConfig,
    shutdown: &Shutdown,
) -> Result<()> {
    loop {
        while reconciler.ok() {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match stream.start_polling(config.poll_interval, shutdown).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    reconciler.error(&err);
                    // fixed back-off so a dead upstream doesn't spin
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        if !config.prevent_exit {
            error!("stopping because of repeated errors");
            return Err(StreamError::RetriesExhausted);
        }
        warn!("error ceiling reached; prevent-exit keeps the stream alive");
        reconciler.clear_errors();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::flush::BatchFlusher;
    use crate::process::{MemoryProcessRegistry, ProcessHandle};
    use crate::queue::EventQueue;
    use crate::reconcile::TermReconciler;
    use crate::sink::MemorySink;
    use crate::terms::MemoryTermSource;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    // ========================================================================
    // Test doubles
    // ========================================================================

    /// Subscription that records whether it was disconnected
    struct TestSubscription {
        disconnected: Arc<AtomicBool>,
    }

    impl Subscription for TestSubscription {
        fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    /// Feed client that records every subscribe call
    #[derive(Default)]
    struct TestFeedClient {
        subscriptions: Mutex<Vec<TermSet>>,
        disconnect_flags: Mutex<Vec<Arc<AtomicBool>>>,
        fail: AtomicBool,
    }

    impl TestFeedClient {
        fn subscribe_count(&self) -> usize {
            self.subscriptions.lock().len()
        }

        fn last_terms(&self) -> Option<TermSet> {
            self.subscriptions.lock().last().cloned()
        }

        fn disconnected_count(&self) -> usize {
            self.disconnect_flags
                .lock()
                .iter()
                .filter(|f| f.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait]
    impl FeedClient for TestFeedClient {
        async fn subscribe(
            &self,
            terms: &TermSet,
            _listener: Arc<dyn FeedListener>,
        ) -> Result<Box<dyn Subscription>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StreamError::Transport("connect refused".into()));
            }
            self.subscriptions.lock().push(terms.clone());
            let flag = Arc::new(AtomicBool::new(false));
            self.disconnect_flags.lock().push(flag.clone());
            Ok(Box::new(TestSubscription {
                disconnected: flag,
            }))
        }
    }

    struct Fixture {
        client: Arc<TestFeedClient>,
        listener: Arc<QueueListener>,
        source: Arc<MemoryTermSource>,
        stream: LiveStream,
    }

    async fn fixture() -> Fixture {
        let queue = Arc::new(EventQueue::new());
        let sink = Arc::new(MemorySink::new());
        let source = Arc::new(MemoryTermSource::new());
        let registry = Arc::new(MemoryProcessRegistry::new());
        let process = ProcessHandle::register(registry, 30, false).await.unwrap();
        let flusher = BatchFlusher::new(queue.clone(), sink, false);
        let reconciler = Arc::new(TermReconciler::new(flusher, process, source.clone(), 5));
        let listener = Arc::new(QueueListener::new(queue));
        let client = Arc::new(TestFeedClient::default());
        let stream = LiveStream::new(client.clone(), listener.clone(), reconciler);
        Fixture {
            client,
            listener,
            source,
            stream,
        }
    }

    // ========================================================================
    // Shutdown token
    // ========================================================================

    #[tokio::test]
    async fn shutdown_is_observed_by_all_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_cancelled());

        shutdown.cancel();
        assert!(clone.is_cancelled());
        // wait returns immediately once cancelled
        clone.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_wait() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        tokio::task::yield_now().await;

        shutdown.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pace_breaks_out_on_cancel() {
        let shutdown = Shutdown::new();
        let start = Instant::now();

        let pacer = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                pace(Duration::from_secs(3600), start, &shutdown).await
            })
        };
        tokio::task::yield_now().await;

        shutdown.cancel();
        assert!(!pacer.await.unwrap(), "cancelled wait reports false");
    }

    // ========================================================================
    // LiveStream subscription management
    // ========================================================================

    #[tokio::test]
    async fn first_tick_subscribes_with_current_terms() {
        let mut fx = fixture().await;
        fx.source.add("rust");

        fx.stream.update_subscription().await.unwrap();

        assert_eq!(fx.client.subscribe_count(), 1);
        assert_eq!(
            fx.client.last_terms().unwrap(),
            TermSet::from(["rust".to_string()])
        );
        assert!(fx.stream.is_connected());
    }

    #[tokio::test]
    async fn unchanged_terms_leave_subscription_alone() {
        let mut fx = fixture().await;
        fx.source.add("rust");

        fx.stream.update_subscription().await.unwrap();
        fx.stream.update_subscription().await.unwrap();
        fx.stream.update_subscription().await.unwrap();

        assert_eq!(fx.client.subscribe_count(), 1);
        assert_eq!(fx.client.disconnected_count(), 0);
    }

    #[tokio::test]
    async fn term_change_reconnects() {
        let mut fx = fixture().await;
        fx.source.add("rust");
        fx.stream.update_subscription().await.unwrap();

        fx.source.add("tokio");
        fx.stream.update_subscription().await.unwrap();

        assert_eq!(fx.client.subscribe_count(), 2);
        assert_eq!(fx.client.disconnected_count(), 1, "old connection dropped");
        assert_eq!(fx.client.last_terms().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn emptied_terms_disconnect_and_idle() {
        let mut fx = fixture().await;
        fx.source.add("rust");
        fx.stream.update_subscription().await.unwrap();

        fx.source.set_enabled("rust", false);
        fx.stream.update_subscription().await.unwrap();

        assert!(!fx.stream.is_connected());
        assert_eq!(fx.client.subscribe_count(), 1);
        assert_eq!(fx.client.disconnected_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_surfaces() {
        let mut fx = fixture().await;
        fx.source.add("rust");
        fx.client.fail.store(true, Ordering::SeqCst);

        let result = fx.stream.update_subscription().await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
    }

    // ========================================================================
    // Poll loop (deterministic time)
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn poll_loop_reraises_fatal_errors_on_driving_task() {
        let mut fx = fixture().await;
        fx.listener
            .record_fatal_error(StreamError::Transport("stream died".into()));

        let shutdown = Shutdown::new();
        let result = fx
            .stream
            .start_polling(Duration::from_secs(1), &shutdown)
            .await;

        assert!(matches!(result, Err(StreamError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_ends_gracefully_on_shutdown() {
        let fx = fixture().await;
        let shutdown = Shutdown::new();
        let listener = fx.listener.clone();

        let mut stream = fx.stream;
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                stream
                    .start_polling(Duration::from_secs(5), &shutdown)
                    .await
            })
        };

        // let a few ticks happen, then cancel mid-wait
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();

        handle.await.unwrap().unwrap();
        assert!(
            listener.is_terminated(),
            "shutdown requests listener termination"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_keeps_polling_terms() {
        let mut fx = fixture().await;
        fx.source.add("rust");

        let shutdown = Shutdown::new();
        let source = fx.source.clone();
        let client = fx.client.clone();

        let handle = {
            let shutdown = shutdown.clone();
            let mut stream = fx.stream;
            tokio::spawn(async move {
                stream
                    .start_polling(Duration::from_secs(1), &shutdown)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(client.subscribe_count(), 1);

        // a term change mid-run triggers a resubscribe on the next tick
        source.add("tokio");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(client.subscribe_count(), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    // ========================================================================
    // Retry loop
    // ========================================================================

    /// Stream double whose sessions always fail
    struct FailingStream {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl EventStream for FailingStream {
        async fn start_polling(&mut self, _interval: Duration, _shutdown: &Shutdown) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::Transport("down".into()))
        }
    }

    async fn reconciler_with_ceiling(ceiling: u32) -> Arc<TermReconciler> {
        let queue = Arc::new(EventQueue::new());
        let sink = Arc::new(MemorySink::new());
        let source = Arc::new(MemoryTermSource::new());
        let registry = Arc::new(MemoryProcessRegistry::new());
        let process = ProcessHandle::register(registry, 30, false).await.unwrap();
        let flusher = BatchFlusher::new(queue, sink, false);
        Arc::new(TermReconciler::new(flusher, process, source, ceiling))
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_gives_up_at_ceiling() {
        let reconciler = reconciler_with_ceiling(5).await;
        let mut stream = FailingStream {
            attempts: AtomicU32::new(0),
        };
        let config = StreamConfig::default();
        let shutdown = Shutdown::new();

        let result = run_stream(&mut stream, reconciler.as_ref(), &config, &shutdown).await;

        assert!(matches!(result, Err(StreamError::RetriesExhausted)));
        assert_eq!(stream.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(reconciler.error_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_stops_cleanly_on_shutdown() {
        let reconciler = reconciler_with_ceiling(1_000).await;
        let mut stream = FailingStream {
            attempts: AtomicU32::new(0),
        };
        let config = StreamConfig::default();
        let shutdown = Shutdown::new();
        shutdown.cancel();

        let result = run_stream(&mut stream, reconciler.as_ref(), &config, &shutdown).await;
        assert!(result.is_ok());
        assert_eq!(stream.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_session_ends_retry_loop() {
        struct OkStream;

        #[async_trait]
        impl EventStream for OkStream {
            async fn start_polling(
                &mut self,
                _interval: Duration,
                _shutdown: &Shutdown,
            ) -> Result<()> {
                Ok(())
            }
        }

        let reconciler = reconciler_with_ceiling(5).await;
        let config = StreamConfig::default();
        let shutdown = Shutdown::new();

        let result = run_stream(&mut OkStream, reconciler.as_ref(), &config, &shutdown).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn prevent_exit_clears_budget_and_keeps_trying() {
        struct CountdownStream {
            attempts: AtomicU32,
            shutdown: Shutdown,
        }

        #[async_trait]
        impl EventStream for CountdownStream {
            async fn start_polling(
                &mut self,
                _interval: Duration,
                _shutdown: &Shutdown,
            ) -> Result<()> {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                if n >= 7 {
                    // simulate an operator stopping the looping process
                    self.shutdown.cancel();
                }
                Err(StreamError::Transport("down".into()))
            }
        }

        let reconciler = reconciler_with_ceiling(3).await;
        let config = StreamConfig::default().prevent_exit(true);
        let shutdown = Shutdown::new();
        let mut stream = CountdownStream {
            attempts: AtomicU32::new(0),
            shutdown: shutdown.clone(),
        };

        let result = run_stream(&mut stream, reconciler.as_ref(), &config, &shutdown).await;

        assert!(result.is_ok(), "prevent-exit never reports exhaustion");
        assert!(
            stream.attempts.load(Ordering::SeqCst) > 3,
            "retries continued past the ceiling"
        );
    }
}
