//! Concurrent fan-out of validated telemetry to downstream handlers

use crate::message::TelemetryMessage;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Capability interface implemented by every downstream consumer of
/// telemetry (alert notifier, debug mirror, future subscribers).
///
/// Handlers must be safe to invoke once per delivered message; the pipeline
/// guarantees at-least-once delivery, not exactly-once.
#[async_trait]
pub trait TelemetryHandler: Send + Sync {
    /// Stable identity used in failure logs.
    fn name(&self) -> &str;

    /// Processes one validated message. A failure here affects only this
    /// handler's contribution to the aggregate result.
    async fn handle(&self, message: &TelemetryMessage) -> anyhow::Result<()>;
}

/// Aggregate dispatch failure: `failed` of `total` handlers rejected the
/// message.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{failed} of {total} telemetry handlers failed")]
pub struct DispatchError {
    /// Number of handlers that rejected the message
    pub failed: usize,
    /// Number of handlers invoked
    pub total: usize,
}

/// Invokes every registered handler concurrently against the same message.
///
/// The handler list is fixed at startup; there is no runtime registry.
/// Dispatch collects every outcome before aggregating, so one rejection
/// never cuts short a sibling handler.
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn TelemetryHandler>>,
}

impl EventDispatcher {
    /// Creates a dispatcher over a fixed set of handlers.
    pub fn new(handlers: Vec<Arc<dyn TelemetryHandler>>) -> Self {
        Self { handlers }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs all handlers against `message` and reports the aggregate result.
    pub async fn dispatch(&self, message: &TelemetryMessage) -> Result<(), DispatchError> {
        if self.handlers.is_empty() {
            return Ok(());
        }

        let outcomes = join_all(
            self.handlers
                .iter()
                .map(|handler| async move { (handler.name(), handler.handle(message).await) }),
        )
        .await;

        let total = outcomes.len();
        let mut failed = 0;
        for (name, outcome) in outcomes {
            if let Err(error) = outcome {
                failed += 1;
                warn!(handler = name, vin = %message.vin, error = %error, "telemetry handler failed");
            }
        }

        if failed > 0 {
            Err(DispatchError { failed, total })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TelemetryHandler for CountingHandler {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _message: &TelemetryMessage) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("handler refused the message")
            }
            Ok(())
        }
    }

    fn message() -> TelemetryMessage {
        TelemetryMessage {
            vin: "5YJ3E1EA7KF000001".to_string(),
            created_at: Utc::now(),
            is_resend: false,
            data: vec![crate::message::DataPoint {
                key: "Odometer".to_string(),
                value: crate::message::DataPointValue::Text("40213".to_string()),
            }],
        }
    }

    #[tokio::test]
    async fn all_handlers_succeeding_is_ok() {
        let first = CountingHandler::new("first", false);
        let second = CountingHandler::new("second", false);
        let dispatcher = EventDispatcher::new(vec![first.clone(), second.clone()]);

        let result = dispatcher.dispatch(&message()).await;

        assert!(result.is_ok());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_failure_counts_exactly_the_failed_handlers() {
        let failing = CountingHandler::new("failing", true);
        let passing = CountingHandler::new("passing", false);
        let dispatcher = EventDispatcher::new(vec![failing.clone(), passing.clone()]);

        let result = dispatcher.dispatch(&message()).await;

        assert_eq!(result, Err(DispatchError { failed: 1, total: 2 }));
        // The failing handler did not cut short its sibling.
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(passing.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_handler_failing_is_reported_in_full() {
        let first = CountingHandler::new("first", true);
        let second = CountingHandler::new("second", true);
        let third = CountingHandler::new("third", true);
        let dispatcher = EventDispatcher::new(vec![first, second, third]);

        let result = dispatcher.dispatch(&message()).await;

        assert_eq!(result, Err(DispatchError { failed: 3, total: 3 }));
    }

    #[tokio::test]
    async fn no_handlers_means_trivial_success() {
        let dispatcher = EventDispatcher::new(Vec::new());
        assert!(dispatcher.dispatch(&message()).await.is_ok());
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn dispatch_error_display_enumerates_counts() {
        let error = DispatchError { failed: 1, total: 2 };
        assert_eq!(error.to_string(), "1 of 2 telemetry handlers failed");
    }
}
