//! Batch processing under a bounded concurrency ceiling
//!
//! The [`BatchProcessor`] drives one batch at a time: every message runs
//! through the injected [`MessageHandler`] behind a semaphore permit, a
//! failed message is handed to the [`RetryManager`] while the batch keeps
//! going, and offsets are committed once the batch loop has drained.

use crate::consumer::error::ConsumerResult;
use crate::consumer::handler::{InboundMessage, MessageHandler};
use crate::retry::{RetryManager, RetryOperation};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Batches slower than this are logged as an operational signal; nothing
/// is aborted.
pub const SLOW_BATCH_THRESHOLD: Duration = Duration::from_secs(5);

/// Broker-side effects of batch processing.
///
/// Implemented over the Kafka client in production and by recording fakes
/// in tests. Every method is best-effort from the batch loop's point of
/// view: failures are logged, never propagated.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Marks a message's offset as eligible for the next broker commit.
    /// Reached only through [`CommitHandle::commit`].
    async fn commit_offset(&self, message: &InboundMessage) -> ConsumerResult<()>;

    /// Marks a message as handled within the current batch.
    async fn resolve_offset(&self, message: &InboundMessage) -> ConsumerResult<()>;

    /// Signals consumer liveness after a message was handled.
    async fn heartbeat(&self) -> ConsumerResult<()>;

    /// Commits whatever offsets accumulated since the last call.
    async fn commit_if_necessary(&self) -> ConsumerResult<()>;
}

/// Commit capability handed to the message handler.
///
/// The handler must invoke [`commit`](Self::commit) if and only if
/// processing succeeded; an uncalled handle leaves the offset uncommitted.
#[derive(Clone)]
pub struct CommitHandle {
    sink: Arc<dyn BatchSink>,
    message: Arc<InboundMessage>,
}

impl CommitHandle {
    /// Binds a commit capability to one message.
    pub fn new(sink: Arc<dyn BatchSink>, message: Arc<InboundMessage>) -> Self {
        Self { sink, message }
    }

    /// Marks this message's offset as committable.
    pub async fn commit(&self) -> ConsumerResult<()> {
        self.sink.commit_offset(&self.message).await
    }
}

/// Processes batches of inbound messages with bounded concurrency.
pub struct BatchProcessor {
    handler: Arc<dyn MessageHandler>,
    sink: Arc<dyn BatchSink>,
    retry: Arc<RetryManager>,
    limiter: Arc<Semaphore>,
    connected: Arc<AtomicBool>,
}

impl BatchProcessor {
    /// Creates a processor over the given handler, sink and retry manager.
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        sink: Arc<dyn BatchSink>,
        retry: Arc<RetryManager>,
        max_concurrency: usize,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            handler,
            sink,
            retry,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            connected,
        }
    }

    /// Runs one batch to completion and commits accumulated offsets.
    ///
    /// Messages inside the batch are processed concurrently up to the
    /// configured ceiling, with no ordering guarantee between them. A
    /// handler failure never stalls the batch: the message moves to the
    /// retry manager and its bookkeeping stays best-effort.
    pub async fn process(&self, batch: Vec<InboundMessage>) {
        if batch.is_empty() {
            return;
        }

        let batch_size = batch.len();
        let started = Instant::now();
        debug!(batch_size, "processing batch");

        join_all(
            batch
                .into_iter()
                .map(|message| self.process_message(Arc::new(message))),
        )
        .await;

        if let Err(err) = self.sink.commit_if_necessary().await {
            error!(error = %err, "offset commit failed");
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_BATCH_THRESHOLD {
            warn!(
                batch_size,
                elapsed_ms = elapsed.as_millis() as u64,
                "batch processing exceeded threshold"
            );
        } else {
            debug!(
                batch_size,
                elapsed_ms = elapsed.as_millis() as u64,
                "batch processed"
            );
        }
    }

    async fn process_message(&self, message: Arc<InboundMessage>) {
        let Ok(_permit) = self.limiter.acquire().await else {
            return;
        };

        if !self.connected.load(Ordering::SeqCst) {
            debug!(
                correlation_id = %message.correlation_id(),
                "connection marked down, skipping message"
            );
            return;
        }

        let commit = CommitHandle::new(Arc::clone(&self.sink), Arc::clone(&message));
        match self.handler.handle(&message, &commit).await {
            Ok(()) => {
                if let Err(err) = self.sink.heartbeat().await {
                    warn!(error = %err, "heartbeat failed");
                }
                if let Err(err) = self.sink.resolve_offset(&message).await {
                    warn!(error = %err, "offset resolution failed");
                }
            }
            Err(err) => {
                self.schedule_retry(Arc::clone(&message), &err);
                // The failed message must not hold up the batch or the
                // consumer group's liveness.
                if let Err(err) = self.sink.resolve_offset(&message).await {
                    warn!(error = %err, "offset resolution failed");
                }
                if let Err(err) = self.sink.heartbeat().await {
                    warn!(error = %err, "heartbeat failed");
                }
            }
        }
    }

    fn schedule_retry(&self, message: Arc<InboundMessage>, error: &dyn std::fmt::Display) {
        let correlation_id = message.correlation_id();
        let handler = Arc::clone(&self.handler);
        let sink = Arc::clone(&self.sink);
        let operation: RetryOperation = Arc::new(move || {
            let handler = Arc::clone(&handler);
            let message = Arc::clone(&message);
            let commit = CommitHandle::new(Arc::clone(&sink), Arc::clone(&message));
            Box::pin(async move {
                handler
                    .handle(&message, &commit)
                    .await
                    .map_err(anyhow::Error::from)
            })
        });
        self.retry.schedule(operation, error, &correlation_id);
    }
}
