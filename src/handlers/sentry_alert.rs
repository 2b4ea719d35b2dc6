//! Sentry-mode alert routing

use crate::dispatch::TelemetryHandler;
use crate::message::{SentryModeState, TelemetryMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// An alert raised for one vehicle's security-monitoring transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SentryAlert {
    /// Vehicle the alert concerns
    pub vin: String,
    /// State that triggered the alert
    pub state: SentryModeState,
    /// Time the vehicle reported the state
    pub occurred_at: DateTime<Utc>,
}

/// Delivery capability for sentry alerts (chat message, push, webhook).
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Delivers one alert.
    async fn notify(&self, alert: &SentryAlert) -> anyhow::Result<()>;
}

/// Notifier that only writes the alert to the log. Default wiring when no
/// external notification channel is configured.
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn notify(&self, alert: &SentryAlert) -> anyhow::Result<()> {
        info!(
            vin = %alert.vin,
            state = %alert.state,
            occurred_at = %alert.occurred_at,
            "sentry mode alert"
        );
        Ok(())
    }
}

/// Routes attention-worthy sentry-mode transitions to the notifier.
///
/// Messages without a `SentryMode` data point, states that do not warrant
/// attention, and resent messages all pass through without effect.
pub struct SentryAlertHandler {
    notifier: Arc<dyn AlertNotifier>,
}

impl SentryAlertHandler {
    /// Creates the handler around a notifier.
    pub fn new(notifier: Arc<dyn AlertNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl TelemetryHandler for SentryAlertHandler {
    fn name(&self) -> &str {
        "sentry-alert"
    }

    async fn handle(&self, message: &TelemetryMessage) -> anyhow::Result<()> {
        let Some(state) = message.sentry_mode() else {
            return Ok(());
        };

        if !state.triggers_alert() {
            debug!(vin = %message.vin, state = %state, "sentry state change without alert");
            return Ok(());
        }

        if message.is_resend {
            // The broker redelivered telemetry we already alerted on once.
            debug!(vin = %message.vin, "resend, suppressing duplicate alert");
            return Ok(());
        }

        self.notifier
            .notify(&SentryAlert {
                vin: message.vin.clone(),
                state,
                occurred_at: message.created_at,
            })
            .await
    }
}
