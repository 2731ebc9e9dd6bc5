//! Error types for VIRTA

use thiserror::Error;

/// Result type alias for VIRTA operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Error type for pipeline operations
///
/// This is the standard error type used across the ingestion pipeline and
/// by external collaborators (sinks, stores, term sources, feed clients).
/// The categories map to how the driving loop handles a failure: transport,
/// sink and term-source errors are counted against the retry budget, while
/// malformed records are skipped locally and never counted.
///
/// # Example
///
/// ```
/// use virta_core::StreamError;
///
/// fn open_feed() -> Result<(), StreamError> {
///     Err(StreamError::Transport("connection reset".to_string()))
/// }
///
/// match open_feed() {
///     Ok(_) => println!("connected"),
///     Err(StreamError::Transport(msg)) => println!("feed down: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum StreamError {
    /// The upstream feed connection failed
    ///
    /// Recoverable: counted against the retry budget and retried with a
    /// fixed back-off by the driving loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// A sink rejected a batch
    ///
    /// The whole batch is treated as lost; there is no partial-batch retry.
    #[error("sink error: {0}")]
    Sink(String),

    /// The term source could not be queried
    #[error("term source error: {0}")]
    TermSource(String),

    /// The process registry could not be read or written
    #[error("process registry error: {0}")]
    Registry(String),

    /// A record could not be interpreted as an event
    ///
    /// Local condition: replay sources skip such records silently, and a
    /// store sink fails the batch that contains one.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// No credential set with the requested name exists
    #[error("unknown credentials: {0}")]
    Credentials(String),

    /// A blocking drain expired before any event arrived
    #[error("no data within timeout")]
    NoData,

    /// The retry budget is exhausted
    #[error("error ceiling reached")]
    RetriesExhausted,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
