//! Reconciliation - one tick of flushing, liveness and term polling
//!
//! A [`Reconciler`] is the capability the driving loop calls once per tick:
//! flush the queue, refresh the process record, and report whether the
//! desired upstream subscription changed. Flushing is deliberately coupled
//! to term polling - terms may not change for days, and the queue must
//! still drain on every tick.
//!
//! Two implementations exist: [`TermReconciler`] polls a real term source;
//! [`ReplayReconciler`] does everything except term polling and always
//! reports "changed", which the replay driver uses to lazily start its
//! reader.

use crate::flush::BatchFlusher;
use crate::process::{ProcessHandle, ProcessStatus};
use crate::terms::{TermSet, TermSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info};
use virta_core::{Result, StreamError};

/// Periodically reconciles desired state and reports whether it changed
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Run one reconciliation tick
    ///
    /// Flushes the queue, refreshes the bound process record (rate, error
    /// count, status, heartbeat), and returns whether the tracked term set
    /// differs from the previously cached one.
    async fn check(&self) -> Result<bool>;

    /// The term set as of the last successful `check`
    fn terms(&self) -> TermSet;

    /// Whether the driver should keep retrying
    fn ok(&self) -> bool;

    /// Count an error against the retry budget; never fails
    fn error(&self, err: &StreamError);

    /// Errors counted so far
    fn error_count(&self) -> u32;

    /// Zero the retry budget (used by loop-forever mode)
    fn clear_errors(&self);

    /// Forget the cached term set so the next poll counts as a change
    fn reset(&self);
}

/// Retry budget shared by reconciler implementations
struct ErrorBudget {
    count: AtomicU32,
    ceiling: u32,
}

impl ErrorBudget {
    fn new(ceiling: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            ceiling,
        }
    }

    fn record(&self, err: &StreamError) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        error!(error = %err, count, ceiling = self.ceiling, "stream error");
    }

    fn ok(&self) -> bool {
        self.count.load(Ordering::SeqCst) < self.ceiling
    }

    fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Live reconciler - polls the term source for subscription changes
pub struct TermReconciler {
    flusher: BatchFlusher,
    process: Arc<ProcessHandle>,
    source: Arc<dyn TermSource>,
    /// `None` right after construction or `reset`, so the very first poll
    /// is always treated as a potential change
    tracked: Mutex<Option<TermSet>>,
    budget: ErrorBudget,
}

impl TermReconciler {
    /// Create a reconciler binding a flusher, a process record and a source
    pub fn new(
        flusher: BatchFlusher,
        process: Arc<ProcessHandle>,
        source: Arc<dyn TermSource>,
        error_ceiling: u32,
    ) -> Self {
        Self {
            flusher,
            process,
            source,
            tracked: Mutex::new(None),
            budget: ErrorBudget::new(error_ceiling),
        }
    }
}

#[async_trait]
impl Reconciler for TermReconciler {
    async fn check(&self) -> Result<bool> {
        // Flushing comes first: it matters more than the term update and
        // must happen even when terms never change.
        let rate = self.flusher.flush().await?;
        self.process.set_event_rate(rate);
        self.process.set_error_count(self.budget.count());

        let fetched = self.source.enabled_terms().await?;
        self.process.set_status(if fetched.is_empty() {
            ProcessStatus::Waiting
        } else {
            ProcessStatus::Running
        });
        self.process.heartbeat().await?;

        let mut tracked = self.tracked.lock();
        let changed = tracked.as_ref() != Some(&fetched);
        if changed {
            info!(count = fetched.len(), "tracked term set changed");
        } else {
            debug!(count = fetched.len(), "term set unchanged");
        }
        *tracked = Some(fetched);
        Ok(changed)
    }

    fn terms(&self) -> TermSet {
        self.tracked.lock().clone().unwrap_or_default()
    }

    fn ok(&self) -> bool {
        self.budget.ok()
    }

    fn error(&self, err: &StreamError) {
        self.budget.record(err);
    }

    fn error_count(&self) -> u32 {
        self.budget.count()
    }

    fn clear_errors(&self) {
        self.budget.clear();
    }

    fn reset(&self) {
        *self.tracked.lock() = None;
    }
}

/// Replay reconciler - flushes and heartbeats, never polls terms
///
/// Always reports a change; the replay driver treats that as "make sure the
/// reader is running".
pub struct ReplayReconciler {
    flusher: BatchFlusher,
    process: Arc<ProcessHandle>,
    budget: ErrorBudget,
}

impl ReplayReconciler {
    /// Create a reconciler for replay mode
    pub fn new(flusher: BatchFlusher, process: Arc<ProcessHandle>, error_ceiling: u32) -> Self {
        Self {
            flusher,
            process,
            budget: ErrorBudget::new(error_ceiling),
        }
    }
}

#[async_trait]
impl Reconciler for ReplayReconciler {
    async fn check(&self) -> Result<bool> {
        let rate = self.flusher.flush().await?;
        self.process.set_event_rate(rate);
        self.process.set_error_count(self.budget.count());
        self.process.heartbeat().await?;
        Ok(true)
    }

    fn terms(&self) -> TermSet {
        TermSet::new()
    }

    fn ok(&self) -> bool {
        self.budget.ok()
    }

    fn error(&self, err: &StreamError) {
        self.budget.record(err);
    }

    fn error_count(&self) -> u32 {
        self.budget.count()
    }

    fn clear_errors(&self) {
        self.budget.clear();
    }

    fn reset(&self) {}
}
