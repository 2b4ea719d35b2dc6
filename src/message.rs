//! Typed telemetry event model
//!
//! A [`TelemetryMessage`] is built once per inbound broker message by the
//! validator, handed to every downstream handler, and discarded after
//! dispatch. It is never persisted.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;

/// Data point key under which vehicles report their security-monitoring state.
pub const SENTRY_MODE_KEY: &str = "SentryMode";

/// Vehicle security-monitoring state as reported in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SentryModeState {
    /// Monitoring disabled
    Off,
    /// Monitoring noticed activity near the vehicle
    Aware,
    /// Monitoring enabled, nothing observed
    Idle,
    /// Monitoring armed
    Armed,
    /// Alarm triggered
    Panic,
    /// Monitoring active with reduced signalling
    Quiet,
    /// State not reported by the vehicle
    Unknown,
}

impl SentryModeState {
    /// Maps a raw wire string onto the enumeration. Anything that is not an
    /// exact member name is rejected.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "Off" => Some(Self::Off),
            "Aware" => Some(Self::Aware),
            "Idle" => Some(Self::Idle),
            "Armed" => Some(Self::Armed),
            "Panic" => Some(Self::Panic),
            "Quiet" => Some(Self::Quiet),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Wire representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Aware => "Aware",
            Self::Idle => "Idle",
            Self::Armed => "Armed",
            Self::Panic => "Panic",
            Self::Quiet => "Quiet",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this state should be routed to the alerting subsystem.
    ///
    /// `Aware` is the transition worth surfacing: the security system has
    /// noticed activity. Steady states and the alarm itself are not
    /// re-announced.
    pub fn triggers_alert(&self) -> bool {
        matches!(self, Self::Aware)
    }
}

impl fmt::Display for SentryModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value carried by a single telemetry data point.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPointValue {
    /// Free-form string value
    Text(String),
    /// Constrained security-monitoring state
    SentryMode(SentryModeState),
}

impl Serialize for DataPointValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DataPointValue", 1)?;
        match self {
            Self::Text(value) => state.serialize_field("stringValue", value)?,
            Self::SentryMode(value) => state.serialize_field("sentryModeStateValue", value)?,
        }
        state.end()
    }
}

/// One `(key, value)` entry of a telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    /// Signal name, e.g. `SentryMode` or `VehicleSpeed`
    pub key: String,
    /// Signal value
    pub value: DataPointValue,
}

/// A validated, immutable telemetry event keyed by vehicle identifier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Vehicle identification number
    pub vin: String,
    /// Time the vehicle produced the event
    pub created_at: DateTime<Utc>,
    /// Whether the broker delivered this event before
    pub is_resend: bool,
    /// Ordered, non-empty list of data points
    pub data: Vec<DataPoint>,
}

impl TelemetryMessage {
    /// Returns the security-monitoring state if this message carries one.
    pub fn sentry_mode(&self) -> Option<SentryModeState> {
        self.data.iter().find_map(|point| match (&*point.key, &point.value) {
            (SENTRY_MODE_KEY, DataPointValue::SentryMode(state)) => Some(*state),
            _ => None,
        })
    }
}
