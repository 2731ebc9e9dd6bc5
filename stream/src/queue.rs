//! Unbounded event buffer with atomic drain-all
//!
//! The queue sits between the receiving task and the driving task. Pushes
//! never block and never fail: unbounded growth is an accepted trade for
//! never stalling the feed connection. Drains are all-or-nothing snapshots
//! of the current contents, so no event is ever seen by two drains and none
//! is lost between a push and the next drain.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use virta_core::{Event, Result, StreamError};

/// Thread-safe unbounded buffer of raw events
///
/// Multiple producers may push concurrently; one consumer drains. Provides
/// counters for monitoring queue throughput.
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    /// Wakes blocked drains when an event arrives
    arrival: Notify,
    metrics: QueueMetrics,
}

/// Counters for queue monitoring
#[derive(Default)]
struct QueueMetrics {
    pushed: AtomicU64,
    drained: AtomicU64,
}

impl EventQueue {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            arrival: Notify::new(),
            metrics: QueueMetrics::default(),
        }
    }

    /// Push an event, never blocking
    ///
    /// Safe to call from the receiving task while a drain is in flight; the
    /// event lands in the current contents or the next drain's snapshot,
    /// never both.
    pub fn push(&self, event: Event) {
        self.events.lock().push_back(event);
        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        self.arrival.notify_one();
    }

    /// Atomically remove and return everything queued right now
    ///
    /// Returns an empty batch when nothing is queued. Events pushed after
    /// the snapshot is taken are left for the next drain.
    pub fn drain_all_nowait(&self) -> Vec<Event> {
        let batch: Vec<Event> = {
            let mut events = self.events.lock();
            std::mem::take(&mut *events).into()
        };
        self.metrics
            .drained
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Drain everything, waiting until at least one event is queued
    pub async fn drain_all(&self) -> Vec<Event> {
        loop {
            // notify_one stores a permit when no drain is parked, so a push
            // landing between the empty check and the await still wakes us.
            let notified = self.arrival.notified();
            let batch = self.drain_all_nowait();
            if !batch.is_empty() {
                return batch;
            }
            notified.await;
        }
    }

    /// Drain everything, waiting at most `timeout` for the first event
    ///
    /// # Errors
    ///
    /// [`StreamError::NoData`] when nothing arrived in time.
    pub async fn drain_all_timeout(&self, timeout: Duration) -> Result<Vec<Event>> {
        tokio::time::timeout(timeout, self.drain_all())
            .await
            .map_err(|_| StreamError::NoData)
    }

    /// Current number of queued events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Total events pushed since creation
    pub fn total_pushed(&self) -> u64 {
        self.metrics.pushed.load(Ordering::Relaxed)
    }

    /// Total events drained since creation
    pub fn total_drained(&self) -> u64 {
        self.metrics.drained.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
