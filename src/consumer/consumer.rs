//! Broker consumer lifecycle over rdkafka
//!
//! Owns the connection to the broker: connect-with-retry at startup,
//! subscription, the batch collection loop, periodic liveness probing with
//! reconnect, and the ordered shutdown sequence (retry manager first, broker
//! client last).

use crate::consumer::{
    batch::{BatchProcessor, BatchSink},
    config::ConsumerConfig,
    error::{ConsumerError, ConsumerResult},
    handler::{InboundMessage, MessageHandler},
    offsets::OffsetTracker,
};
use crate::retry::{RetryManager, RetryPolicy};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use async_trait::async_trait;

/// Upper bound on a single metadata liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker-side effects implemented over the Kafka client.
///
/// Commit bookkeeping goes through the shared [`OffsetTracker`];
/// `commit_if_necessary` drains it into an explicit broker commit. The
/// consumer-group protocol heartbeat is owned by librdkafka's background
/// thread, so the pipeline-level heartbeat records a progress timestamp,
/// exposed through [`KafkaBatchSink::last_heartbeat`].
pub struct KafkaBatchSink {
    client: Arc<StreamConsumer>,
    offsets: Arc<OffsetTracker>,
    last_heartbeat: Mutex<Instant>,
}

impl KafkaBatchSink {
    /// Binds a sink to one broker client.
    pub fn new(client: Arc<StreamConsumer>, offsets: Arc<OffsetTracker>) -> Self {
        Self {
            client,
            offsets,
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    /// Instant of the most recent heartbeat.
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }
}

#[async_trait]
impl BatchSink for KafkaBatchSink {
    async fn commit_offset(&self, message: &InboundMessage) -> ConsumerResult<()> {
        self.offsets
            .mark_committable(&message.topic, message.partition, message.offset);
        Ok(())
    }

    async fn resolve_offset(&self, message: &InboundMessage) -> ConsumerResult<()> {
        self.offsets
            .resolve(&message.topic, message.partition, message.offset);
        Ok(())
    }

    async fn heartbeat(&self) -> ConsumerResult<()> {
        *self.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    async fn commit_if_necessary(&self) -> ConsumerResult<()> {
        let pending = self.offsets.take_committable();
        if pending.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (topic, partition, offset) in &pending {
            // Kafka commits point at the next offset to read.
            list.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(|err| ConsumerError::Commit(err.to_string()))?;
        }
        debug!(partitions = pending.len(), "committing offsets");
        self.client
            .commit(&list, CommitMode::Async)
            .map_err(|err| ConsumerError::Commit(err.to_string()))
    }
}

/// Telemetry broker consumer.
///
/// State machine: `Disconnected -> Connecting -> Connected -> {Consuming,
/// Reconnecting} -> Disconnected` on shutdown. Only the initial connection
/// failing is fatal; everything after startup is retried or logged.
pub struct BrokerConsumer {
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    retry: Arc<RetryManager>,
    offsets: Arc<OffsetTracker>,
    connected: Arc<AtomicBool>,
    client: Arc<RwLock<Option<Arc<StreamConsumer>>>>,
    shutdown: CancellationToken,
}

impl BrokerConsumer {
    /// Creates a consumer for the given handler.
    pub fn new(config: ConsumerConfig, handler: Arc<dyn MessageHandler>) -> ConsumerResult<Self> {
        config.validate().map_err(ConsumerError::Config)?;
        let retry = Arc::new(RetryManager::new(config.retry_policy.clone()));
        Ok(Self {
            config,
            handler,
            retry,
            offsets: Arc::new(OffsetTracker::new()),
            connected: Arc::new(AtomicBool::new(false)),
            client: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the consumer when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests a graceful shutdown.
    pub fn initiate_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the broker connection is currently considered live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Runs the consumer until shutdown.
    ///
    /// Returns an error only when the initial connection attempts are
    /// exhausted; that error must abort the process.
    pub async fn run(&self) -> ConsumerResult<()> {
        let mut client = self.connect_with_retry().await?;
        let health = self.spawn_health_check();

        loop {
            let sink: Arc<dyn BatchSink> = Arc::new(KafkaBatchSink::new(
                Arc::clone(&client),
                Arc::clone(&self.offsets),
            ));
            let processor = BatchProcessor::new(
                Arc::clone(&self.handler),
                Arc::clone(&sink),
                Arc::clone(&self.retry),
                self.config.max_concurrency,
                Arc::clone(&self.connected),
            );

            self.consume_with(&client, &processor).await;

            if self.shutdown.is_cancelled() {
                // Pending retries must not fire into a released client.
                self.retry.stop();
                if let Err(err) = sink.commit_if_necessary().await {
                    error!(error = %err, "final offset commit failed");
                }
                break;
            }

            warn!("broker connection lost, entering reconnect cycle");
            match self.reconnect().await {
                Some(next) => client = next,
                None => {
                    self.retry.stop();
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.client.write() = None;
        let _ = health.await;
        info!("consumer shutdown complete");
        Ok(())
    }

    /// Consumes batches on one connection until shutdown or the health
    /// check marks the connection down.
    async fn consume_with(&self, client: &Arc<StreamConsumer>, processor: &BatchProcessor) {
        let mut stream = client.stream();
        info!(topic = %self.config.topic, group = %self.config.group_id, "consuming");

        loop {
            if self.shutdown.is_cancelled() || !self.connected.load(Ordering::SeqCst) {
                return;
            }
            match self.collect_batch(&mut stream).await {
                Some(batch) => processor.process(batch).await,
                None => return,
            }
        }
    }

    /// Collects one batch, bounded by batch size and the batch timeout.
    ///
    /// Returns `None` once no further batch should be fetched on this
    /// connection.
    async fn collect_batch<'a, S>(&self, stream: &mut S) -> Option<Vec<InboundMessage>>
    where
        S: futures::Stream<Item = KafkaResult<BorrowedMessage<'a>>> + Unpin,
    {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);
        let mut liveness = tokio::time::interval(Duration::from_secs(1));
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return if batch.is_empty() { None } else { Some(batch) };
                }
                _ = &mut deadline, if !batch.is_empty() => {
                    return Some(batch);
                }
                _ = liveness.tick() => {
                    if !self.connected.load(Ordering::SeqCst) {
                        return if batch.is_empty() { None } else { Some(batch) };
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if batch.is_empty() {
                            deadline
                                .as_mut()
                                .reset(tokio::time::Instant::now() + self.config.batch_timeout);
                        }
                        batch.push(detach(&message));
                        if batch.len() >= self.config.batch_size {
                            return Some(batch);
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "kafka poll error");
                    }
                    None => {
                        return if batch.is_empty() { None } else { Some(batch) };
                    }
                }
            }
        }
    }

    /// Connects with bounded attempts; exhaustion is fatal to the caller.
    async fn connect_with_retry(&self) -> ConsumerResult<Arc<StreamConsumer>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            info!(attempt, brokers = %self.config.brokers, "connecting to broker");
            match self.try_connect().await {
                Ok(client) => {
                    *self.client.write() = Some(Arc::clone(&client));
                    self.connected.store(true, Ordering::SeqCst);
                    info!(attempt, topic = %self.config.topic, "connected and subscribed");
                    return Ok(client);
                }
                Err(err) if attempt >= self.config.max_connect_attempts => {
                    return Err(ConsumerError::Connection(format!(
                        "broker unreachable after {attempt} attempts: {err}"
                    )));
                }
                Err(err) => {
                    let delay = connect_backoff(&self.config.retry_policy, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "broker connection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(ConsumerError::Connection(
                                "shutdown requested during connect".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connection attempt: create the client, probe it, subscribe.
    async fn try_connect(&self) -> ConsumerResult<Arc<StreamConsumer>> {
        let client = Arc::new(self.create_client()?);
        probe_liveness(Arc::clone(&client), self.config.topic.clone()).await?;
        client
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|err| ConsumerError::Connection(format!("failed to subscribe: {err}")))?;
        Ok(client)
    }

    fn create_client(&self) -> ConsumerResult<StreamConsumer> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            // Resume from the committed position; never read from the
            // beginning of the log.
            .set("auto.offset.reset", "latest");

        client_config
            .create()
            .map_err(|err| ConsumerError::Connection(format!("failed to create consumer: {err}")))
    }

    /// Keeps reconnecting until it succeeds or shutdown is requested.
    async fn reconnect(&self) -> Option<Arc<StreamConsumer>> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.connect_with_retry().await {
                Ok(client) => return Some(client),
                Err(err) => {
                    error!(error = %err, "reconnect failed, will keep trying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.retry_policy.max_delay) => {}
                    }
                }
            }
        }
    }

    /// Periodic liveness probe; a failed probe marks the connection down
    /// and lets the consume loop run the reconnect cycle.
    fn spawn_health_check(&self) -> JoinHandle<()> {
        let client_slot = Arc::clone(&self.client);
        let connected = Arc::clone(&self.connected);
        let shutdown = self.shutdown.clone();
        let topic = self.config.topic.clone();
        let interval = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate first tick would probe before consumption starts.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if !connected.load(Ordering::SeqCst) {
                            continue;
                        }
                        let Some(client) = client_slot.read().clone() else {
                            continue;
                        };
                        match probe_liveness(client, topic.clone()).await {
                            Ok(()) => debug!("broker liveness probe ok"),
                            Err(err) => {
                                warn!(error = %err, "liveness probe failed, marking connection down");
                                connected.store(false, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Lightweight liveness probe: fetch topic metadata off the async runtime.
async fn probe_liveness(client: Arc<StreamConsumer>, topic: String) -> ConsumerResult<()> {
    tokio::task::spawn_blocking(move || {
        client
            .fetch_metadata(Some(&topic), PROBE_TIMEOUT)
            .map(|_| ())
            .map_err(ConsumerError::from)
    })
    .await
    .map_err(|err| ConsumerError::Connection(format!("liveness probe task failed: {err}")))?
}

/// Delay between connection attempts: `min(base_delay * 2^attempt, max_delay)`.
fn connect_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(31)))
        .min(policy.max_delay)
}

fn detach(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(bytes::Bytes::copy_from_slice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connect_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        assert_eq!(connect_backoff(&policy, 1), Duration::from_millis(2000));
        assert_eq!(connect_backoff(&policy, 2), Duration::from_millis(4000));
        assert_eq!(connect_backoff(&policy, 4), Duration::from_millis(16_000));
        assert_eq!(connect_backoff(&policy, 5), Duration::from_millis(30_000));
        assert_eq!(connect_backoff(&policy, 30), Duration::from_millis(30_000));
    }
}
