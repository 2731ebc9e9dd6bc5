//! Process lifecycle - liveness records for running ingestion instances
//!
//! Every ingestion instance registers one [`ProcessRecord`] at startup and
//! keeps it alive by heartbeating at an interval strictly shorter than its
//! timeout. Records are an append-only audit log of process incarnations:
//! they are never deleted, only marked stopped - either by their owner on
//! shutdown, or cooperatively by [`ProcessRegistry::expire_timed_out`] when
//! a crashed owner never got to report its own death.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use virta_core::Result;

/// Status of one ingestion process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Streaming with a non-empty term set
    Running,
    /// Alive but idle - no terms currently enabled
    Waiting,
    /// Terminated, or expired without a heartbeat
    Stopped,
}

impl ProcessStatus {
    /// The stored string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Waiting => "WAITING",
            ProcessStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness record for one running ingestion instance
///
/// Identity is (hostname, pid, creation time). Invariant:
/// `expires_at == last_heartbeat + timeout_seconds`.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// Registry-assigned identifier, `None` until first saved
    pub id: Option<u64>,
    /// Host the process runs on
    pub hostname: String,
    /// OS process id
    pub pid: u32,
    /// When this incarnation started
    pub created_at: DateTime<Utc>,
    /// Heartbeat budget: readers treat the record as stopped this long
    /// after the last heartbeat
    pub timeout_seconds: u64,
    /// Last time the owner reported in
    pub last_heartbeat: DateTime<Utc>,
    /// When the record goes stale
    pub expires_at: DateTime<Utc>,
    /// Current status as last reported
    pub status: ProcessStatus,
    /// Most recent flush throughput, events per second
    pub event_rate: f64,
    /// Errors counted against the retry budget so far
    pub error_count: u32,
    /// Resident set sample in MiB, when performance monitoring is on
    pub memory_mb: Option<f64>,
    /// Name of the credential set in use, when any
    pub credentials: Option<String>,
}

impl ProcessRecord {
    /// Build a record for the current host and process
    ///
    /// Not yet persisted; save it through a registry (or a
    /// [`ProcessHandle`]) to obtain an id.
    pub fn create(timeout_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            hostname: local_hostname(),
            pid: std::process::id(),
            created_at: now,
            timeout_seconds,
            last_heartbeat: now,
            expires_at: now + TimeDelta::seconds(timeout_seconds as i64),
            status: ProcessStatus::Waiting,
            event_rate: 0.0,
            error_count: 0,
            memory_mb: None,
            credentials: None,
        }
    }

    /// How long this incarnation has been reporting in
    pub fn lifetime(&self) -> TimeDelta {
        self.last_heartbeat - self.created_at
    }

    /// Whether the record is stale at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Status as a reader must interpret it at `now`
    ///
    /// An expired record counts as stopped even before maintenance has
    /// caught up with it.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ProcessStatus {
        if self.is_expired(now) {
            ProcessStatus::Stopped
        } else {
            self.status
        }
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} ({}s old)",
            self.hostname,
            self.pid,
            self.status,
            self.lifetime().num_seconds()
        )
    }
}

/// Durable store for process records - external collaborator
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Insert or update a record, returning its registry id
    async fn save(&self, record: &ProcessRecord) -> Result<u64>;

    /// Mark every record whose expiry has passed as stopped
    ///
    /// Idempotent and safe to run concurrently from multiple instances.
    /// Returns how many records were newly stopped.
    async fn expire_timed_out(&self) -> Result<usize>;

    /// Records heartbeated within the window, most recent first
    ///
    /// Runs [`expire_timed_out`](Self::expire_timed_out) first so stale
    /// records read as stopped.
    async fn list_active(&self, within: TimeDelta) -> Result<Vec<ProcessRecord>>;
}

/// In-memory registry for tests and single-process deployments
pub struct MemoryProcessRegistry {
    records: RwLock<Vec<ProcessRecord>>,
    next_id: AtomicU64,
}

impl MemoryProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of every record ever registered
    pub fn all(&self) -> Vec<ProcessRecord> {
        self.records.read().clone()
    }
}

impl Default for MemoryProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRegistry for MemoryProcessRegistry {
    async fn save(&self, record: &ProcessRecord) -> Result<u64> {
        let mut records = self.records.write();
        match record.id {
            Some(id) => {
                if let Some(existing) = records.iter_mut().find(|r| r.id == Some(id)) {
                    *existing = record.clone();
                } else {
                    records.push(record.clone());
                }
                Ok(id)
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut record = record.clone();
                record.id = Some(id);
                records.push(record);
                Ok(id)
            }
        }
    }

    async fn expire_timed_out(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;
        for record in self.records.write().iter_mut() {
            if record.is_expired(now) && record.status != ProcessStatus::Stopped {
                record.status = ProcessStatus::Stopped;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_active(&self, within: TimeDelta) -> Result<Vec<ProcessRecord>> {
        self.expire_timed_out().await?;
        let cutoff = Utc::now() - within;
        let mut active: Vec<ProcessRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.last_heartbeat > cutoff)
            .cloned()
            .collect();
        active.sort_by_key(|r| std::cmp::Reverse(r.last_heartbeat));
        Ok(active)
    }
}

/// A registered process record plus the registry that persists it
///
/// Mutated only by its own instance: the reconciler pushes rate and error
/// counts in, the driver flips status, and `heartbeat` persists the lot.
pub struct ProcessHandle {
    record: Mutex<ProcessRecord>,
    registry: Arc<dyn ProcessRegistry>,
    monitor_memory: bool,
}

impl ProcessHandle {
    /// Create and persist a record for this instance
    pub async fn register(
        registry: Arc<dyn ProcessRegistry>,
        timeout_seconds: u64,
        monitor_memory: bool,
    ) -> Result<Arc<Self>> {
        let mut record = ProcessRecord::create(timeout_seconds);
        if monitor_memory {
            record.memory_mb = sample_memory_mb();
        }
        let id = registry.save(&record).await?;
        record.id = Some(id);
        tracing::info!(
            id,
            hostname = %record.hostname,
            pid = record.pid,
            timeout_seconds,
            "registered stream process"
        );
        Ok(Arc::new(Self {
            record: Mutex::new(record),
            registry,
            monitor_memory,
        }))
    }

    /// Refresh the liveness window and persist the record
    ///
    /// Must be called at an interval strictly shorter than the record's
    /// timeout or observers will treat the process as stopped. Does not
    /// touch status; set that explicitly.
    pub async fn heartbeat(&self) -> Result<()> {
        let snapshot = {
            let mut record = self.record.lock();
            let now = Utc::now();
            record.last_heartbeat = now;
            record.expires_at = now + TimeDelta::seconds(record.timeout_seconds as i64);
            if self.monitor_memory {
                record.memory_mb = sample_memory_mb();
            }
            record.clone()
        };
        self.registry.save(&snapshot).await?;
        Ok(())
    }

    /// Mark the record stopped and heartbeat it one final time
    pub async fn mark_stopped(&self) -> Result<()> {
        self.set_status(ProcessStatus::Stopped);
        self.heartbeat().await
    }

    /// Set the reported status
    pub fn set_status(&self, status: ProcessStatus) {
        self.record.lock().status = status;
    }

    /// Record the latest flush throughput
    pub fn set_event_rate(&self, rate: f64) {
        self.record.lock().event_rate = rate;
    }

    /// Record the accumulated error count
    pub fn set_error_count(&self, count: u32) {
        self.record.lock().error_count = count;
    }

    /// Record which credential set is in use
    pub fn set_credentials(&self, name: impl Into<String>) {
        self.record.lock().credentials = Some(name.into());
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> ProcessRecord {
        self.record.lock().clone()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Sample this process's resident set size in MiB
///
/// Linux only; other platforms report `None`.
pub fn sample_memory_mb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: f64 = line
            .trim_start_matches("VmRSS:")
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .ok()?;
        Some(kb / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
