//! Device records for tracking discovered plugs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::{PollStatus, PowerReading, SwitchState};

/// Protocol version announced in a discovery beacon
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProtocolVersion {
    /// Legacy plaintext protocol, pollable without a device key
    V31,
    /// Encrypted protocol, needs the device's local key to poll
    V33,
    /// Any other announced version ("3.2", "3.4", "3.5", ...)
    Other(String),
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &str {
        match self {
            Self::V31 => "3.1",
            Self::V33 => "3.3",
            Self::Other(v) => v,
        }
    }

    /// Whether a session must be switched to the encrypted protocol before querying
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::V31)
    }

    /// Port that devices of this version broadcast their beacons on
    pub fn beacon_port(&self) -> BeaconPort {
        match self {
            Self::V31 => BeaconPort::Plain,
            _ => BeaconPort::Encrypted,
        }
    }
}

impl From<&str> for ProtocolVersion {
    fn from(s: &str) -> Self {
        match s.trim() {
            "3.1" => Self::V31,
            "3.3" => Self::V33,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ProtocolVersion {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ProtocolVersion> for String {
    fn from(v: ProtocolVersion) -> Self {
        v.as_str().to_string()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two well-known discovery ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconPort {
    /// Plaintext beacons (protocol 3.1), UDP 6666 by default
    Plain,
    /// AES-encrypted beacons (protocol 3.3+), UDP 6667 by default
    Encrypted,
}

impl std::fmt::Display for BeaconPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => f.write_str("plain"),
            Self::Encrypted => f.write_str("encrypted"),
        }
    }
}

/// How well a beacon could be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStatus {
    /// All identity fields were recovered
    Valid,
    /// Payload could not be decoded by any known strategy
    Unknown,
    /// Frame too short, broken JSON, or missing identity fields
    Malformed,
}

impl Default for DecodeStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A device seen during a discovery scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Network address the device is reachable at (registry key)
    pub network_address: String,
    /// Device id (`gwId` in the beacon)
    pub device_id: Option<String>,
    /// Key announced in the beacon (`productKey`)
    pub device_key: Option<String>,
    /// Announced protocol version
    pub protocol_version: Option<ProtocolVersion>,
    /// Result of decoding the first beacon from this address
    pub decode_status: DecodeStatus,
    /// Switch state from the last telemetry poll
    pub switch_state: Option<SwitchState>,
    /// Power metrics from the last telemetry poll
    pub power: Option<PowerReading>,
    /// Outcome of the last telemetry poll
    pub poll_status: Option<PollStatus>,
    /// Error message when the last poll did not succeed
    pub last_error: Option<String>,
    /// Number of beacons received from this address
    pub sightings: u32,
    /// When the first beacon was received
    pub first_seen: DateTime<Utc>,
    /// When the latest beacon was received
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a record for a fully decoded beacon
    pub fn new(
        network_address: impl Into<String>,
        device_id: impl Into<String>,
        device_key: impl Into<String>,
        protocol_version: ProtocolVersion,
    ) -> Self {
        let mut record = Self::unidentified(network_address, DecodeStatus::Valid);
        record.device_id = Some(device_id.into());
        record.device_key = Some(device_key.into());
        record.protocol_version = Some(protocol_version);
        record
    }

    /// Create a record for an address whose beacon could not be decoded
    pub fn unidentified(network_address: impl Into<String>, decode_status: DecodeStatus) -> Self {
        let now = Utc::now();
        Self {
            network_address: network_address.into(),
            device_id: None,
            device_key: None,
            protocol_version: None,
            decode_status,
            switch_state: None,
            power: None,
            poll_status: None,
            last_error: None,
            sightings: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Record another beacon from this address
    pub fn touch(&mut self) {
        self.sightings = self.sightings.saturating_add(1);
        self.last_seen = Utc::now();
    }

    /// Merge the outcome of a telemetry poll into the record
    pub fn apply_poll(
        &mut self,
        switch_state: SwitchState,
        power: Option<PowerReading>,
        status: PollStatus,
    ) {
        self.switch_state = Some(switch_state);
        self.power = power;
        self.last_error = if status.is_error() {
            Some(status.to_string())
        } else {
            None
        };
        self.poll_status = Some(status);
    }

    /// Whether a telemetry poll has been merged into this record
    pub fn is_polled(&self) -> bool {
        self.poll_status.is_some()
    }
}
