//! Stream configuration
//!
//! One explicit value passed into the drivers at construction. Nothing here
//! is process-wide or mutable after startup; the binary builds it from CLI
//! flags, tests build it inline.

use std::time::Duration;

/// Configuration for one ingestion instance
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Seconds between reconciliation ticks (term polls, flushes,
    /// heartbeats)
    pub poll_interval: Duration,
    /// Also persist the embedded repost carried by a post
    pub capture_embedded: bool,
    /// Errors tolerated before the driver stops retrying
    pub error_ceiling: u32,
    /// Keep retrying forever instead of exiting at the ceiling
    pub prevent_exit: bool,
    /// Sample memory usage into the process record on heartbeats
    pub monitor_performance: bool,
}

impl StreamConfig {
    /// Set the poll interval from fractional seconds
    pub fn poll_interval_secs(mut self, secs: f64) -> Self {
        self.poll_interval = Duration::from_secs_f64(secs.max(0.1));
        self
    }

    /// Enable or disable embedded repost capture
    pub fn capture_embedded(mut self, capture: bool) -> Self {
        self.capture_embedded = capture;
        self
    }

    /// Set how many errors the driver tolerates
    pub fn error_ceiling(mut self, ceiling: u32) -> Self {
        self.error_ceiling = ceiling;
        self
    }

    /// Keep retrying past the error ceiling
    pub fn prevent_exit(mut self, prevent: bool) -> Self {
        self.prevent_exit = prevent;
        self
    }

    /// Enable or disable memory sampling
    pub fn monitor_performance(mut self, monitor: bool) -> Self {
        self.monitor_performance = monitor;
        self
    }

    /// Process-record timeout derived from the poll interval
    ///
    /// Three missed ticks and observers treat the process as stopped.
    pub fn heartbeat_timeout_secs(&self) -> u64 {
        (self.poll_interval.as_secs_f64() * 3.0).ceil().max(1.0) as u64
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            capture_embedded: false,
            error_ceiling: 5,
            prevent_exit: false,
            monitor_performance: true,
        }
    }
}
