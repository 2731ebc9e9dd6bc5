//! VIRTA - buffered ingestion for push-style event feeds
//!
//! Ingests a continuous feed of social events, buffers them off the
//! receiving task, and flushes them in batches to a sink on the same cadence
//! as filter-term reconciliation and process heartbeats.
//!
//! # Architecture
//!
//! ```text
//! Upstream feed ──► QueueListener ──► EventQueue ──► BatchFlusher ──► Sink
//!  (receiving task)                                      ▲
//!                                                        │ every tick
//! TermSource ◄── Reconciler ◄── poll loop (driving task) ┘
//!                    │
//!                    └──► ProcessRegistry (heartbeat / liveness)
//! ```
//!
//! Two tasks cooperate per instance: the *receiving* task (owned by the feed
//! client, or by [`replay::ReplayStream`] in replay mode) only pushes into
//! the queue; the *driving* task runs the poll loop, flushing, heartbeating
//! and restarting the upstream subscription when the tracked term set
//! changes. The queue is the only structure both touch.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod config;
pub mod credentials;
pub mod driver;
pub mod flush;
pub mod listener;
pub mod process;
pub mod queue;
pub mod reconcile;
pub mod replay;
pub mod sink;
pub mod store;
pub mod terms;

pub use config::StreamConfig;
pub use credentials::{Credential, CredentialStore, MemoryCredentialStore};
pub use driver::{EventStream, FeedClient, LiveStream, Shutdown, Subscription, run_stream};
pub use flush::BatchFlusher;
pub use listener::{FeedListener, QueueListener};
pub use process::{
    MemoryProcessRegistry, ProcessHandle, ProcessRecord, ProcessRegistry, ProcessStatus,
};
pub use queue::EventQueue;
pub use reconcile::{Reconciler, ReplayReconciler, TermReconciler};
pub use replay::{Framing, ReplayStream};
pub use sink::{EventSink, JsonlSink, MemorySink, StdoutSink, StoreSink};
pub use store::{EventStore, MemoryEventStore};
pub use terms::{MemoryTermSource, TermSet, TermSource};
