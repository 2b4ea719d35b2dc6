//! Downstream telemetry handlers
//!
//! Concrete implementations of [`crate::dispatch::TelemetryHandler`]: the
//! sentry-mode alert route and the debug mirror. Handlers are registered
//! into the dispatcher once at startup.

mod debug_mirror;
mod sentry_alert;

pub use debug_mirror::DebugMirrorHandler;
pub use sentry_alert::{AlertNotifier, LogAlertNotifier, SentryAlert, SentryAlertHandler};
