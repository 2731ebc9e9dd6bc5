//! Feed listener - adapts the upstream push callback into a queue producer
//!
//! The feed client calls [`FeedListener::on_event`] from its own task for
//! every decoded object it receives. The listener does the minimum possible
//! there: enqueue and report whether to keep the connection open. Everything
//! else (persistence, term polling, liveness) happens on the driving task.

use crate::queue::EventQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use virta_core::{Event, StreamError};

/// Capability the upstream feed client drives
///
/// Contract for implementors of a feed transport:
/// - deliver every decoded object through [`on_event`](Self::on_event)
/// - drop the connection promptly once `on_event` returns `false`
/// - surface unrecoverable transport failures through
///   [`record_fatal_error`](Self::record_fatal_error) instead of panicking
///   on the receiving task
pub trait FeedListener: Send + Sync {
    /// Consume one decoded event; returns whether to keep delivering
    fn on_event(&self, event: Event) -> bool;

    /// Store an unrecoverable transport error for the driving task
    fn record_fatal_error(&self, error: StreamError);
}

/// Queue-backed listener with graceful termination
///
/// Operated by the receiving task; drained by the driving task. Once
/// [`request_termination`](Self::request_termination) has been called,
/// every subsequent `on_event` returns `false`, which the feed client must
/// honor by closing its connection.
pub struct QueueListener {
    queue: Arc<EventQueue>,
    terminated: AtomicBool,
    /// Fatal error mailbox: stored by the receiving task, re-raised on the
    /// driving task so error handling stays centralized
    fatal: Mutex<Option<StreamError>>,
}

impl QueueListener {
    /// Create a listener feeding the given queue
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            terminated: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    /// The queue this listener fills
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Ask the feed client to drop its connection
    ///
    /// Idempotent. Takes effect on the next `on_event` call; one in-flight
    /// event may still be accepted.
    pub fn request_termination(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether termination has been requested
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Retrieve a stored fatal error, clearing the mailbox
    pub fn take_fatal_error(&self) -> Option<StreamError> {
        self.fatal.lock().take()
    }
}

impl FeedListener for QueueListener {
    fn on_event(&self, event: Event) -> bool {
        self.queue.push(event);
        !self.terminated.load(Ordering::SeqCst)
    }

    fn record_fatal_error(&self, error: StreamError) {
        tracing::warn!(error = %error, "receiving task reported a fatal error");
        let mut fatal = self.fatal.lock();
        // keep the first error; later ones are consequences
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}
