//! # Log Watcher
//!
//! Tails the configured event-log channels and feeds raw records to the
//! orchestrator with at-least-once semantics:
//!
//! - each channel runs an independent subscription task with a bounded
//!   buffer (`max_queue`, overflow policy Block or DropOldest);
//! - a record's bookmark is acknowledged only after the orchestrator
//!   durably accepts it, and the persisted bookmark never advances past an
//!   unacknowledged predecessor;
//! - dropped subscriptions reconnect on the configured backoff schedule and
//!   resume from the persisted bookmark (bounded duplicates allowed);
//! - permission failures are fatal for their channel only, parse errors are
//!   counted and skipped.

pub mod bookmark;
pub mod buffer;
pub mod source;

pub use bookmark::{AckTracker, BookmarkCommitter};
pub use buffer::ChannelBuffer;
pub use source::{ChannelFilter, ChannelSource, JsonlFileSource};

use async_trait::async_trait;
use futures::StreamExt;
use sentinel_core::config::{ChannelConfig, LogWatcherConfig};
use sentinel_core::error::{ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::retry::FixedSchedule;
use sentinel_core::types::RawRecord;
use sentinel_store::BookmarkRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Downstream acceptor for raw records. Implemented by the orchestrator.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Durably accept a record. `QueueFull` means try again (backpressure);
    /// any other error is terminal for the record.
    async fn submit(&self, record: RawRecord) -> Result<()>;
}

pub struct LogWatcher {
    source: Arc<dyn ChannelSource>,
    sink: Arc<dyn RecordSink>,
    bookmarks: BookmarkRepository,
    config: LogWatcherConfig,
    metrics: PipelineMetrics,
}

impl LogWatcher {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        sink: Arc<dyn RecordSink>,
        bookmarks: BookmarkRepository,
        config: LogWatcherConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            source,
            sink,
            bookmarks,
            config,
            metrics,
        }
    }

    /// Start all channel tasks plus the bookmark committer. Returns once
    /// spawned; tasks stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let committer = BookmarkCommitter::new(self.bookmarks.clone());
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            committer
                .clone()
                .run(Duration::from_secs(2), cancel.clone()),
        ));

        for channel in self.config.channels.iter().filter(|c| c.enabled) {
            let buffer = Arc::new(ChannelBuffer::<RawRecord>::new(
                channel.max_queue,
                channel.overflow_policy,
            ));

            handles.push(tokio::spawn(channel_subscription_task(
                Arc::clone(&self.source),
                self.bookmarks.clone(),
                channel.clone(),
                FixedSchedule::new(self.config.reconnect_backoff_seconds.clone()),
                Arc::clone(&buffer),
                committer.clone(),
                self.metrics.clone(),
                cancel.clone(),
            )));

            handles.push(tokio::spawn(channel_pump_task(
                channel.name.clone(),
                Arc::clone(&buffer),
                Arc::clone(&self.sink),
                committer.clone(),
                cancel.clone(),
            )));
        }

        handles
    }
}

/// Reads the subscription stream into the channel buffer, reconnecting with
/// backoff on drops and resuming from the persisted bookmark.
#[allow(clippy::too_many_arguments)]
async fn channel_subscription_task(
    source: Arc<dyn ChannelSource>,
    bookmarks: BookmarkRepository,
    channel: ChannelConfig,
    backoff: FixedSchedule,
    buffer: Arc<ChannelBuffer<RawRecord>>,
    committer: BookmarkCommitter,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
) {
    let mut reconnect_attempt = 0usize;

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }

        eprintln!("DEBUG about to read bookmark for {}", channel.name);
        let from_token = match bookmarks.read(&channel.name).await {
            Ok(bookmark) => bookmark.map(|b| b.token),
            Err(e) => {
                warn!(channel = %channel.name, error = %e, "bookmark read failed, starting fresh");
                None
            }
        };

        let mut stream = match source.subscribe(&channel, from_token).await {
            Ok(stream) => {
                info!(channel = %channel.name, resume_after = ?from_token, "channel subscribed");
                stream
            }
            Err(e) if e.code == ErrorCode::ChannelPermissionDenied => {
                error!(channel = %channel.name, error = %e, "permission denied; channel stopped");
                return;
            }
            Err(e) if e.code == ErrorCode::InvalidFilter => {
                error!(channel = %channel.name, error = %e, "invalid filter; channel stopped");
                return;
            }
            Err(e) => {
                let delay = backoff.delay_for_attempt(reconnect_attempt);
                reconnect_attempt += 1;
                warn!(
                    channel = %channel.name,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "subscription failed, reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(record)) => {
                    reconnect_attempt = 0;
                    metrics.watcher_records.with_label_values(&[&channel.name]).inc();
                    committer.emitted(&channel.name, record.bookmark_token);
                    let dropped = buffer.push(record).await;
                    if dropped > 0 {
                        metrics
                            .watcher_dropped
                            .with_label_values(&[&channel.name])
                            .inc_by(dropped as u64);
                    }
                }
                Some(Err(e)) if e.code == ErrorCode::MalformedRecord => {
                    metrics
                        .watcher_parse_errors
                        .with_label_values(&[&channel.name])
                        .inc();
                    // The bookmark advances past unparseable records.
                    if let Some(token) = e
                        .context
                        .metadata
                        .get("bookmark_token")
                        .and_then(|v| v.as_u64())
                    {
                        committer.emitted(&channel.name, token);
                        committer.skip(&channel.name, token);
                    }
                    warn!(channel = %channel.name, error = %e, "skipping unparseable record");
                }
                Some(Err(e)) if e.code == ErrorCode::ChannelPermissionDenied => {
                    error!(channel = %channel.name, error = %e, "permission denied; channel stopped");
                    return;
                }
                Some(Err(e)) => {
                    let delay = backoff.delay_for_attempt(reconnect_attempt);
                    reconnect_attempt += 1;
                    warn!(
                        channel = %channel.name,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "subscription dropped, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(delay) => continue 'reconnect,
                    }
                }
                None => {
                    let delay = backoff.delay_for_attempt(reconnect_attempt);
                    reconnect_attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(delay) => continue 'reconnect,
                    }
                }
            }
        }
    }
}

/// Drains the channel buffer into the sink, acknowledging bookmarks once
/// records are durably accepted. Intake backpressure (`QueueFull`) parks
/// this task, which in turn fills the buffer and blocks the subscription.
async fn channel_pump_task(
    channel: String,
    buffer: Arc<ChannelBuffer<RawRecord>>,
    sink: Arc<dyn RecordSink>,
    committer: BookmarkCommitter,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = buffer.pop() => record,
        };
        let token = record.bookmark_token;

        loop {
            match sink.submit(record.clone()).await {
                Ok(()) => {
                    committer.ack(&channel, token);
                    break;
                }
                Err(e) if e.code == ErrorCode::QueueFull => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
                Err(e) if e.code == ErrorCode::ShuttingDown => return,
                Err(e) => {
                    // Validation rejects are terminal for the record; the
                    // bookmark still advances so it is not replayed forever.
                    warn!(channel = %channel, token, error = %e, "record rejected by intake");
                    committer.skip(&channel, token);
                    break;
                }
            }
        }
    }
}
