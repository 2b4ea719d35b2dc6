//! Consumer error types

use thiserror::Error;

/// Errors produced by the broker consumer and its collaborators.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker unreachable or connection lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Error surfaced by the Kafka client
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Message handler rejected the message
    #[error("Processing error: {0}")]
    Processing(String),

    /// Offset commit failed
    #[error("Commit error: {0}")]
    Commit(String),
}

/// Result alias for consumer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;
