//! Normalized switch and power readings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relay state reported by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SwitchState {
    /// Single relay plug
    Single(bool),
    /// Multi-switch device, keyed by data point index ("1".."7")
    Multi(BTreeMap<String, bool>),
}

impl Default for SwitchState {
    fn default() -> Self {
        Self::Single(false)
    }
}

/// Power metrics in display units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub watts: f64,
    pub milliamps: f64,
    pub volts: f64,
}

/// Energy use extrapolated from an instantaneous wattage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedUsage {
    pub day_kwh: f64,
    pub week_kwh: f64,
    pub month_kwh: f64,
}

impl PowerReading {
    /// Project the current draw over a day, week and month
    pub fn projected_usage(&self) -> ProjectedUsage {
        let day_kwh = (self.watts / 1000.0) * 24.0;
        let week_kwh = 7.0 * day_kwh;
        // 52 weeks spread over 12 months
        let month_kwh = (week_kwh * 52.0) / 12.0;
        ProjectedUsage {
            day_kwh,
            week_kwh,
            month_kwh,
        }
    }
}

/// Outcome of a telemetry poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Power data found
    Ok,
    /// Device answered but exposes no known power layout
    PowerDataUnavailable,
    /// Device returned an empty response
    IncompleteResponse,
    /// Transport kept failing until the retry budget ran out
    TimeoutPollingDevice,
    /// Data points could not be extracted until the retry budget ran out
    MissingPowerData,
    /// Cancelled by the user
    UserInterrupt,
}

impl PollStatus {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::PowerDataUnavailable => "Power data unavailable",
            Self::IncompleteResponse => "Incomplete response",
            Self::TimeoutPollingDevice => "Timeout polling device",
            Self::MissingPowerData => "Missing Power Data",
            Self::UserInterrupt => "User Interrupt",
        };
        f.write_str(s)
    }
}
