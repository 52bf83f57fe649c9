//! Plugscan Discovery - Beacon discovery for smart plugs
//!
//! This crate provides:
//! - Discovery-key AES handling for encrypted beacons
//! - Beacon frame decoding with a plaintext/encrypted fallback chain
//! - A dual-port UDP broadcast listener
//! - The scan loop with its device registry and adaptive stop heuristic

pub mod codec;
pub mod crypto;
pub mod listener;
pub mod scanner;

pub use codec::{DecodedBeacon, DiscoveryFrame, FrameCodec, RawDatagram};
pub use listener::{BroadcastListener, DatagramSource, ListenerConfig, ListenerError, Received};
pub use scanner::{
    DeviceRegistry, DiscoveryScanner, ScanCounters, ScanEvent, ScanReport, ScannerConfig,
    DEFAULT_MAX_RETRIES,
};
