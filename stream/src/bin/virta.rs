//! VIRTA command line - live ingestion and capture replay
//!
//! `virta live` ingests a feed delivered on stdin as JSON lines (one decoded
//! event per line), which makes any external feed fetcher composable:
//!
//! ```text
//! feed-fetcher --stream | virta live --track rust --out events.jsonl
//! ```
//!
//! `virta replay` pushes a capture file through the identical processing
//! path, optionally rate-limited, for tests and backfills.
//!
//! Events land on stdout as JSON lines unless `--out` selects a file.
//! Credentials for a real transport are read from `VIRTA_API_KEY`,
//! `VIRTA_API_SECRET`, `VIRTA_ACCESS_TOKEN` and `VIRTA_ACCESS_TOKEN_SECRET`;
//! when a keys name is given but no credentials exist yet, the process waits
//! for them, heartbeating so it still reads as alive.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use virta_core::{Event, StreamError};
use virta_stream::credentials::wait_for_credentials;
use virta_stream::driver::run_stream;
use virta_stream::terms::TermSet;
use virta_stream::{
    BatchFlusher, Credential, EventQueue, EventSink, FeedClient, FeedListener, Framing,
    JsonlSink, LiveStream, MemoryCredentialStore, MemoryProcessRegistry, MemoryTermSource,
    ProcessHandle, ProcessRegistry, QueueListener, ReplayReconciler, ReplayStream, Shutdown,
    StdoutSink, StreamConfig, Subscription, TermReconciler,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a live feed delivered on stdin as JSON lines
    Live {
        /// Credential set to use
        keys_name: Option<String>,

        /// Seconds between term updates and event inserts
        #[arg(long, default_value_t = 10.0)]
        poll_interval: f64,

        /// Term to track (repeatable)
        #[arg(long = "track")]
        track: Vec<String>,

        /// Append events to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also persist embedded reposts
        #[arg(long)]
        capture_embedded: bool,

        /// Keep retrying forever instead of exiting at the error ceiling
        #[arg(long)]
        prevent_exit: bool,
    },

    /// Fake a live feed by replaying a capture file
    Replay {
        /// Capture file: pretty-printed objects, or JSON lines with
        /// --line-delimited
        file: PathBuf,

        /// Seconds between event inserts
        #[arg(long, default_value_t = 10.0)]
        poll_interval: f64,

        /// Events per second to forward
        #[arg(long)]
        rate_limit: Option<f64>,

        /// Stop after this many events
        #[arg(long)]
        limit: Option<u64>,

        /// Capture is one record per line instead of pretty-printed
        #[arg(long)]
        line_delimited: bool,

        /// Append events to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Command::Live {
            keys_name,
            poll_interval,
            track,
            out,
            capture_embedded,
            prevent_exit,
        } => {
            let config = StreamConfig::default()
                .poll_interval_secs(poll_interval)
                .capture_embedded(capture_embedded)
                .prevent_exit(prevent_exit);
            run_live(keys_name, track, out, config).await
        }
        Command::Replay {
            file,
            poll_interval,
            rate_limit,
            limit,
            line_delimited,
            out,
        } => {
            let config = StreamConfig::default().poll_interval_secs(poll_interval);
            let framing = if line_delimited {
                Framing::Lines
            } else {
                Framing::Pretty
            };
            run_replay(file, framing, rate_limit, limit, out, config).await
        }
    }
}

async fn run_live(
    keys_name: Option<String>,
    track: Vec<String>,
    out: Option<PathBuf>,
    config: StreamConfig,
) -> anyhow::Result<()> {
    let registry: Arc<dyn ProcessRegistry> = Arc::new(MemoryProcessRegistry::new());
    // self-heal records left behind by crashed instances
    registry.expire_timed_out().await?;
    let process = ProcessHandle::register(
        registry.clone(),
        config.heartbeat_timeout_secs(),
        config.monitor_performance,
    )
    .await?;
    registry.expire_timed_out().await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let credential_store = MemoryCredentialStore::new();
    let have_env_credentials = match credential_from_env(keys_name.as_deref()) {
        Some(credential) => {
            credential_store.insert(credential);
            true
        }
        None => false,
    };
    if keys_name.is_some() || have_env_credentials {
        let credential = wait_for_credentials(
            &credential_store,
            keys_name.as_deref(),
            &process,
            config.poll_interval,
            &shutdown,
        )
        .await?;
        if credential.is_none() {
            // shutdown arrived while waiting
            finalize(&process).await;
            return Ok(());
        }
    } else {
        info!("no credential set configured; the stdin feed needs none");
    }

    let queue = Arc::new(EventQueue::new());
    let listener = Arc::new(QueueListener::new(queue.clone()));
    let sink = build_sink(&out).await?;
    let flusher = BatchFlusher::new(queue, sink, config.capture_embedded);

    let terms = Arc::new(MemoryTermSource::new());
    for term in track {
        terms.add(term);
    }

    let reconciler = Arc::new(TermReconciler::new(
        flusher,
        process.clone(),
        terms,
        config.error_ceiling,
    ));
    let mut stream = LiveStream::new(
        Arc::new(StdinFeedClient),
        listener,
        reconciler.clone(),
    );

    let result = run_stream(&mut stream, reconciler.as_ref(), &config, &shutdown).await;
    finalize(&process).await;
    result?;
    Ok(())
}

async fn run_replay(
    file: PathBuf,
    framing: Framing,
    rate_limit: Option<f64>,
    limit: Option<u64>,
    out: Option<PathBuf>,
    config: StreamConfig,
) -> anyhow::Result<()> {
    let registry: Arc<dyn ProcessRegistry> = Arc::new(MemoryProcessRegistry::new());
    registry.expire_timed_out().await?;
    let process = ProcessHandle::register(
        registry.clone(),
        config.heartbeat_timeout_secs(),
        config.monitor_performance,
    )
    .await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    info!(file = %file.display(), "streaming from capture");
    if let Some(rate) = rate_limit {
        info!(rate, "rate limited");
    }

    let queue = Arc::new(EventQueue::new());
    let listener = Arc::new(QueueListener::new(queue.clone()));
    let sink = build_sink(&out).await?;
    let flusher = BatchFlusher::new(queue, sink, config.capture_embedded);
    let reconciler = Arc::new(ReplayReconciler::new(
        flusher,
        process.clone(),
        config.error_ceiling,
    ));

    let mut stream = ReplayStream::new(&file, framing, listener, reconciler.clone());
    if let Some(rate) = rate_limit {
        stream = stream.rate_limit(rate);
    }
    if let Some(limit) = limit {
        stream = stream.limit(limit);
    }

    let result = run_stream(&mut stream, reconciler.as_ref(), &config, &shutdown).await;
    info!(forwarded = stream.cursor().forwarded, "replay session over");
    finalize(&process).await;
    result?;
    Ok(())
}

/// Final heartbeat marking the process stopped; never fails the exit path
async fn finalize(process: &ProcessHandle) {
    if let Err(err) = process.mark_stopped().await {
        error!(error = %err, "failed to record final stop");
    }
}

async fn build_sink(out: &Option<PathBuf>) -> anyhow::Result<Arc<dyn EventSink>> {
    let sink: Arc<dyn EventSink> = match out {
        Some(path) => {
            info!(path = %path.display(), "appending events to file");
            Arc::new(JsonlSink::open(path).await?)
        }
        None => Arc::new(StdoutSink::new()),
    };
    Ok(sink)
}

fn credential_from_env(keys_name: Option<&str>) -> Option<Credential> {
    let mut credential = Credential::named(keys_name.unwrap_or("default"));
    credential.api_key = std::env::var("VIRTA_API_KEY").ok()?;
    credential.api_secret = std::env::var("VIRTA_API_SECRET").ok()?;
    credential.access_token = std::env::var("VIRTA_ACCESS_TOKEN").ok()?;
    credential.access_token_secret = std::env::var("VIRTA_ACCESS_TOKEN_SECRET").ok()?;
    Some(credential)
}

/// Feed client reading JSON lines from stdin
///
/// Undecodable lines are skipped; EOF is a transport failure so the retry
/// loop gets to decide whether to give up.
struct StdinFeedClient;

struct StdinSubscription {
    task: tokio::task::JoinHandle<()>,
}

impl Subscription for StdinSubscription {
    fn disconnect(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl FeedClient for StdinFeedClient {
    async fn subscribe(
        &self,
        terms: &TermSet,
        listener: Arc<dyn FeedListener>,
    ) -> virta_core::Result<Box<dyn Subscription>> {
        // stdin cannot filter; terms are logged for the record
        info!(terms = ?terms, "reading feed from stdin");
        let task = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Event::parse(&line) {
                            Ok(event) => {
                                if !listener.on_event(event) {
                                    break;
                                }
                            }
                            Err(err) => debug!(error = %err, "skipping undecodable line"),
                        }
                    }
                    Ok(None) => {
                        listener
                            .record_fatal_error(StreamError::Transport("stdin feed closed".into()));
                        break;
                    }
                    Err(err) => {
                        listener.record_fatal_error(StreamError::Transport(err.to_string()));
                        break;
                    }
                }
            }
        });
        Ok(Box::new(StdinSubscription { task }))
    }
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
