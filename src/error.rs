//! Crate-level error types

use crate::consumer::ConsumerError;
use crate::dispatch::DispatchError;
use thiserror::Error;

/// Any error the telemetry pipeline can surface to an embedder.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker consumer failure
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    /// Aggregate handler failure
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
