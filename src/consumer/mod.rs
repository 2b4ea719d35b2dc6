//! Kafka consumer for the telemetry pipeline
//!
//! This module provides a production-ready consumer implementation with:
//! - Connect-with-retry and fatal startup error propagation
//! - Explicit offset management (commit-if-necessary semantics)
//! - Bounded per-batch concurrency
//! - Handler failure hand-off to the retry manager
//! - Periodic health checks with reconnect
//! - Graceful, ordered shutdown
//!
//! # Example
//!
//! ```no_run
//! use fleetwatch::consumer::{create_telemetry_consumer, ConsumerConfig};
//! use fleetwatch::dispatch::{EventDispatcher, TelemetryHandler};
//! use fleetwatch::handlers::{LogAlertNotifier, SentryAlertHandler};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092")
//!     .group_id("fleetwatch-telemetry")
//!     .topic("vehicle-telemetry")
//!     .build();
//!
//! let handlers: Vec<Arc<dyn TelemetryHandler>> =
//!     vec![Arc::new(SentryAlertHandler::new(Arc::new(LogAlertNotifier)))];
//! let dispatcher = Arc::new(EventDispatcher::new(handlers));
//!
//! let consumer = create_telemetry_consumer(config, dispatcher)?;
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod offsets;

pub use batch::{BatchProcessor, BatchSink, CommitHandle, SLOW_BATCH_THRESHOLD};
pub use config::{ConsumerConfig, ConsumerConfigBuilder};
pub use consumer::{BrokerConsumer, KafkaBatchSink};
pub use error::{ConsumerError, ConsumerResult};
pub use handler::{InboundMessage, MessageHandler};
pub use offsets::OffsetTracker;

use crate::dispatch::EventDispatcher;
use crate::validator;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the standard telemetry consumer: validator + dispatcher behind
/// the message handler contract.
pub fn create_telemetry_consumer(
    config: ConsumerConfig,
    dispatcher: Arc<EventDispatcher>,
) -> crate::error::Result<BrokerConsumer> {
    let handler = Arc::new(TelemetryMessageHandler::new(dispatcher));
    Ok(BrokerConsumer::new(config, handler)?)
}

/// Message handler composing the validator and the event dispatcher.
///
/// Structurally invalid payloads are dropped here — retrying them cannot
/// succeed — so only dispatch failures flow back to the consumer's retry
/// path. The commit callback runs if and only if dispatch succeeded.
pub struct TelemetryMessageHandler {
    dispatcher: Arc<EventDispatcher>,
}

impl TelemetryMessageHandler {
    /// Wraps a dispatcher in the handler contract.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for TelemetryMessageHandler {
    async fn handle(&self, message: &InboundMessage, commit: &CommitHandle) -> ConsumerResult<()> {
        let payload = match message.payload() {
            Some(payload) if !payload.is_empty() => payload,
            _ => {
                debug!(
                    correlation_id = %message.correlation_id(),
                    "skipping message without payload"
                );
                return Ok(());
            }
        };

        let raw: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    correlation_id = %message.correlation_id(),
                    error = %err,
                    "skipping unparsable payload"
                );
                return Ok(());
            }
        };

        let outcome = validator::validate(&raw);
        let Some(telemetry) = outcome.message else {
            warn!(
                correlation_id = %message.correlation_id(),
                errors = %outcome.errors.join(", "),
                "skipping invalid telemetry payload"
            );
            return Ok(());
        };

        self.dispatcher
            .dispatch(&telemetry)
            .await
            .map_err(|err| ConsumerError::Processing(err.to_string()))?;

        commit.commit().await?;
        Ok(())
    }
}
