//! Plugscan Core - Shared types for smart-plug discovery and polling
//!
//! This crate provides the foundational types used across the workspace:
//! - Device records accumulated by a discovery scan
//! - Protocol versions and the beacon ports they broadcast on
//! - Normalized switch and power readings produced by a telemetry poll

pub mod device;
pub mod reading;

pub use device::{BeaconPort, DecodeStatus, DeviceRecord, ProtocolVersion};
pub use reading::{PollStatus, PowerReading, ProjectedUsage, SwitchState};
