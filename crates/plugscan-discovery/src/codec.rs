//! Discovery beacon decoding
//!
//! A beacon is a 20-byte header, a payload and an 8-byte trailer. The
//! payload is plaintext JSON on older firmware and AES-ECB encrypted JSON on
//! newer firmware. Decoding never fails hard: a datagram that cannot be
//! understood still yields an outcome naming the address it came from.

use plugscan_core::{BeaconPort, DecodeStatus, ProtocolVersion};
use plugscan_telemetry::transport::{command, encode_frame};
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use tracing::{debug, trace};

use crate::crypto::{decrypt_ecb, discovery_key, encrypt_ecb};

/// Wire magic, sequence number, command code, length and return code
pub const HEADER_LEN: usize = 20;
/// Checksum and terminator magic
pub const TRAILER_LEN: usize = 8;
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// A datagram as received on one of the beacon ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDatagram {
    pub source: IpAddr,
    pub payload: Vec<u8>,
    pub port: BeaconPort,
}

/// Identity announced by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    pub network_address: String,
    pub device_id: String,
    pub device_key: String,
    pub protocol_version: ProtocolVersion,
}

/// Outcome of decoding one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedBeacon {
    Valid(DiscoveryFrame),
    /// No decode strategy produced JSON
    Unknown { address: String },
    /// Too short, broken plaintext JSON, or identity fields missing
    Malformed { address: String },
}

impl DecodedBeacon {
    /// Address the device should be tracked under
    pub fn address(&self) -> &str {
        match self {
            Self::Valid(frame) => &frame.network_address,
            Self::Unknown { address } | Self::Malformed { address } => address,
        }
    }

    pub fn status(&self) -> DecodeStatus {
        match self {
            Self::Valid(_) => DecodeStatus::Valid,
            Self::Unknown { .. } => DecodeStatus::Unknown,
            Self::Malformed { .. } => DecodeStatus::Malformed,
        }
    }

    pub fn version(&self) -> Option<&ProtocolVersion> {
        match self {
            Self::Valid(frame) => Some(&frame.protocol_version),
            _ => None,
        }
    }
}

/// Beacon JSON fields consumed by discovery
#[derive(Deserialize)]
struct BeaconJson {
    ip: String,
    #[serde(rename = "gwId")]
    gw_id: String,
    #[serde(rename = "productKey")]
    product_key: String,
    version: String,
}

/// Ways to turn a payload that does not start with `{` into JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// AES-128-ECB with the discovery key
    Encrypted,
    /// UTF-8 JSON with leading whitespace or tag bytes
    Plaintext,
}

/// Tried in order, first success wins
const FALLBACK_CHAIN: [Strategy; 2] = [Strategy::Encrypted, Strategy::Plaintext];

/// Decodes beacon datagrams
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: [u8; 16],
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(*discovery_key())
    }
}

impl FrameCodec {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Decode a received datagram
    pub fn decode(&self, raw: &RawDatagram) -> DecodedBeacon {
        self.decode_bytes(raw.source, &raw.payload)
    }

    /// Decode the bytes of a datagram received from `source`
    pub fn decode_bytes(&self, source: IpAddr, data: &[u8]) -> DecodedBeacon {
        let address = source.to_string();

        if data.len() < MIN_FRAME_LEN {
            debug!(ip = %address, len = data.len(), "Beacon too short");
            return DecodedBeacon::Malformed { address };
        }
        let payload = &data[HEADER_LEN..data.len() - TRAILER_LEN];

        let json = if payload.first() == Some(&b'{') {
            match serde_json::from_slice::<Value>(payload) {
                Ok(json) => json,
                Err(e) => {
                    debug!(ip = %address, error = %e, "Plaintext beacon is not valid JSON");
                    return DecodedBeacon::Malformed { address };
                }
            }
        } else {
            match FALLBACK_CHAIN
                .iter()
                .find_map(|strategy| self.attempt(*strategy, payload))
            {
                Some(json) => json,
                None => {
                    debug!(ip = %address, "Beacon payload could not be decoded");
                    trace!(ip = %address, payload = ?payload, "Undecodable payload");
                    return DecodedBeacon::Unknown { address };
                }
            }
        };

        match serde_json::from_value::<BeaconJson>(json) {
            Ok(beacon) => DecodedBeacon::Valid(DiscoveryFrame {
                network_address: beacon.ip,
                device_id: beacon.gw_id,
                device_key: beacon.product_key,
                protocol_version: ProtocolVersion::from(beacon.version),
            }),
            Err(e) => {
                debug!(ip = %address, error = %e, "Beacon JSON missing identity fields");
                DecodedBeacon::Malformed { address }
            }
        }
    }

    fn attempt(&self, strategy: Strategy, payload: &[u8]) -> Option<Value> {
        let text = match strategy {
            Strategy::Encrypted => {
                let plain = decrypt_ecb(&self.key, payload).ok()?;
                String::from_utf8(plain).ok()?
            }
            Strategy::Plaintext => std::str::from_utf8(payload).ok()?.to_string(),
        };
        let json = serde_json::from_str(&text).ok();
        if json.is_some() {
            trace!(strategy = ?strategy, "Beacon payload decoded");
        }
        json
    }

    /// Build a beacon datagram carrying `json`, encrypted or in plaintext
    pub fn encode_beacon(&self, json: &Value, encrypted: bool) -> Vec<u8> {
        let text = json.to_string();
        if encrypted {
            let payload = encrypt_ecb(&self.key, text.as_bytes());
            encode_frame(0, command::UDP_NEW, Some(0), &payload)
        } else {
            encode_frame(0, command::UDP, Some(0), text.as_bytes())
        }
    }
}
