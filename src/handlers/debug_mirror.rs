//! Debug mirror of validated telemetry

use crate::dispatch::TelemetryHandler;
use crate::message::TelemetryMessage;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

/// Republishes every validated message to a mirror topic, keyed by VIN.
///
/// The mirror is an ordinary downstream handler: a publish failure counts
/// against the dispatch aggregate and makes the message eligible for retry.
pub struct DebugMirrorHandler {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl DebugMirrorHandler {
    /// Creates a mirror producer against the given brokers.
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Self::from_producer(producer, topic))
    }

    /// Wraps an existing producer.
    pub fn from_producer(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl TelemetryHandler for DebugMirrorHandler {
    fn name(&self) -> &str {
        "debug-mirror"
    }

    async fn handle(&self, message: &TelemetryMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(message)?;
        self.producer
            .send(
                FutureRecord::to(&self.topic)
                    .key(&message.vin)
                    .payload(&payload),
                self.send_timeout,
            )
            .await
            .map_err(|(err, _)| anyhow::anyhow!("mirror publish failed: {err}"))?;

        debug!(vin = %message.vin, topic = %self.topic, "mirrored telemetry message");
        Ok(())
    }
}
