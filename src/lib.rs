//! Vehicle telemetry ingestion pipeline
//!
//! This library consumes vehicle telemetry events from a Kafka-compatible
//! broker, validates and normalizes them, and fans each event out to
//! independently pluggable downstream handlers with at-least-once delivery.
//! Failed deliveries are retried with bounded exponential backoff while the
//! batch keeps moving.
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
//! let config = ConsumerConfig::from_env()
//!     .map_err(|err| anyhow::anyhow!(err))?;
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

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

// Re-export commonly used items
pub use dispatch::{DispatchError, EventDispatcher, TelemetryHandler};
pub use error::{PipelineError, Result};
pub use message::{DataPoint, DataPointValue, SentryModeState, TelemetryMessage};
pub use retry::{RetryManager, RetryOperation, RetryPolicy};
pub use validator::{validate, ValidationResult};

/// Typed telemetry event model
pub mod message;

/// Structural payload validation
pub mod validator;

/// Concurrent handler fan-out
pub mod dispatch;

/// Downstream handler implementations
pub mod handlers;

/// Bounded-attempt retry scheduling
pub mod retry;

/// Broker consumer implementation
pub mod consumer;

/// Error types
pub mod error;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
