//! Bounded-retry telemetry polling
//!
//! A poll opens a session, queries the device status and decodes the data
//! points into a switch state and power metrics. Transport failures and
//! data point extraction failures each get their own retry budget.

use plugscan_core::{PollStatus, PowerReading, ProtocolVersion, SwitchState};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::{self, RetryDecision, RetryError, RetryPolicy};
use crate::session::{SessionError, SessionFactory};

/// Attempts allowed per failure kind before giving up
pub const RETRY_LIMIT: u32 = 5;

/// Fixed wait between attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Data point indices that may hold relay states on multi-switch devices
const SWITCH_DPS: [&str; 7] = ["1", "2", "3", "4", "5", "6", "7"];

/// Result of polling one device
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub switch_state: SwitchState,
    pub power: Option<PowerReading>,
    pub status: PollStatus,
    /// Number of status queries issued
    pub attempts: u32,
}

impl PollResult {
    fn failed(status: PollStatus, attempts: u32) -> Self {
        Self {
            switch_state: SwitchState::Single(false),
            power: None,
            status,
            attempts,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ExtractError {
    #[error("response has no dps mapping")]
    MissingDps,
    #[error("data point {0} missing")]
    MissingDataPoint(String),
    #[error("data point {dp} has unexpected value {value}")]
    InvalidDataPoint { dp: String, value: Value },
}

/// Switch state and optional power metrics decoded from a status response
#[derive(Debug, Clone, PartialEq)]
pub struct Readings {
    pub switch_state: SwitchState,
    pub power: Option<PowerReading>,
}

impl Readings {
    fn into_result(self, attempts: u32) -> PollResult {
        let status = if self.power.is_some() {
            PollStatus::Ok
        } else {
            PollStatus::PowerDataUnavailable
        };
        PollResult {
            switch_state: self.switch_state,
            power: self.power,
            status,
            attempts,
        }
    }
}

fn dp_bool(dps: &Map<String, Value>, dp: &str) -> Result<bool, ExtractError> {
    match dps.get(dp) {
        None => Err(ExtractError::MissingDataPoint(dp.to_string())),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|v| v != 0.0).unwrap_or(false)),
        Some(other) => Err(ExtractError::InvalidDataPoint {
            dp: dp.to_string(),
            value: other.clone(),
        }),
    }
}

fn dp_number(dps: &Map<String, Value>, dp: &str) -> Result<f64, ExtractError> {
    let value = dps
        .get(dp)
        .ok_or_else(|| ExtractError::MissingDataPoint(dp.to_string()))?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| ExtractError::InvalidDataPoint {
        dp: dp.to_string(),
        value: value.clone(),
    })
}

/// Decode switch state and power metrics from a status response.
///
/// Power layouts are tried in order: dp 19/18/20 (W*10, mA, V*10), then
/// dp 5/4/6 with the same scaling.
pub fn extract_readings(response: &Value) -> Result<Readings, ExtractError> {
    let dps = response
        .get("dps")
        .and_then(Value::as_object)
        .ok_or(ExtractError::MissingDps)?;

    let primary = dp_bool(dps, "1")?;

    // dp 2 (switch 2) together with dp 10 (countdown 2) marks a multi-switch device.
    // Indices 4..6 may hold the dp5 power layout, so only boolean entries are relays.
    let switch_state = if dps.contains_key("2") && dps.contains_key("10") {
        let switches: BTreeMap<String, bool> = SWITCH_DPS
            .iter()
            .filter_map(|dp| match dps.get(*dp) {
                Some(Value::Bool(on)) => Some((dp.to_string(), *on)),
                _ => None,
            })
            .collect();
        SwitchState::Multi(switches)
    } else {
        SwitchState::Single(primary)
    };

    let power = if dps.contains_key("19") {
        Some(PowerReading {
            watts: dp_number(dps, "19")? / 10.0,
            milliamps: dp_number(dps, "18")?,
            volts: dp_number(dps, "20")? / 10.0,
        })
    } else if dps.contains_key("5") {
        Some(PowerReading {
            watts: dp_number(dps, "5")? / 10.0,
            milliamps: dp_number(dps, "4")?,
            volts: dp_number(dps, "6")? / 10.0,
        })
    } else {
        None
    };

    Ok(Readings {
        switch_state,
        power,
    })
}

/// A response with nothing in it
fn is_empty_response(response: &Value) -> bool {
    match response {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}

/// Polls devices through a [`SessionFactory`]
#[derive(Clone)]
pub struct TelemetryPoller {
    factory: Arc<dyn SessionFactory>,
    policy: RetryPolicy,
}

impl TelemetryPoller {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_policy(factory, RetryPolicy::fixed(RETRY_LIMIT, RETRY_DELAY))
    }

    pub fn with_policy(factory: Arc<dyn SessionFactory>, policy: RetryPolicy) -> Self {
        Self { factory, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Poll a device for switch state and power metrics
    pub async fn poll(
        &self,
        device_id: &str,
        address: &str,
        key: &str,
        version: &ProtocolVersion,
        cancel: &CancellationToken,
    ) -> PollResult {
        let mut transport_budget = self.policy.budget();
        let mut extract_budget = self.policy.budget();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut session = self.factory.open(device_id, address, key);
            if version.is_encrypted() {
                session.set_protocol_version(version);
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(device = %device_id, ip = %address, "CANCEL: interrupted while polling device");
                    return PollResult::failed(PollStatus::UserInterrupt, attempts);
                }
                r = session.status() => r,
            };

            let decision = match response {
                Err(e) => {
                    debug!(device = %device_id, ip = %address, attempt = attempts, error = %e, "Status query failed");
                    let decision = transport_budget.record_failure();
                    if decision == RetryDecision::Exhausted {
                        info!(
                            device = %device_id,
                            ip = %address,
                            attempts = attempts,
                            "TIMEOUT: no response from device"
                        );
                        return PollResult::failed(PollStatus::TimeoutPollingDevice, attempts);
                    }
                    decision
                }
                Ok(data) if is_empty_response(&data) => {
                    info!(device = %device_id, ip = %address, "Incomplete response from device");
                    return PollResult::failed(PollStatus::IncompleteResponse, attempts);
                }
                Ok(data) => match extract_readings(&data) {
                    Ok(readings) => {
                        let result = readings.into_result(attempts);
                        info!(
                            device = %device_id,
                            ip = %address,
                            switch = ?result.switch_state,
                            power = ?result.power,
                            status = %result.status,
                            "Polled device"
                        );
                        return result;
                    }
                    Err(e) => {
                        debug!(device = %device_id, ip = %address, attempt = attempts, error = %e, "Could not extract data points");
                        let decision = extract_budget.record_failure();
                        if decision == RetryDecision::Exhausted {
                            info!(
                                device = %device_id,
                                ip = %address,
                                "NO POWER DATA: response from device missing power data"
                            );
                            return PollResult::failed(PollStatus::MissingPowerData, attempts);
                        }
                        decision
                    }
                },
            };

            if let RetryDecision::Retry(delay) = decision {
                if retry::wait(delay, cancel).await.is_err() {
                    info!(device = %device_id, ip = %address, "CANCEL: interrupted while waiting to retry");
                    return PollResult::failed(PollStatus::UserInterrupt, attempts);
                }
            }
        }
    }

    /// Poll a device and return its raw status response
    pub async fn poll_raw(
        &self,
        device_id: &str,
        address: &str,
        key: &str,
        version: &ProtocolVersion,
        cancel: &CancellationToken,
    ) -> Result<Value, RetryError<SessionError>> {
        retry::retry(&self.policy, cancel, |attempt| {
            let mut session = self.factory.open(device_id, address, key);
            if version.is_encrypted() {
                session.set_protocol_version(version);
            }
            debug!(device = %device_id, ip = %address, attempt = attempt, "Raw status query");
            async move { session.status().await }
        })
        .await
    }
}
