//! Human readable and JSON output

use chrono::{DateTime, Utc};
use plugscan_core::{DecodeStatus, DeviceRecord, SwitchState};
use plugscan_discovery::{ScanEvent, ScanReport};
use plugscan_telemetry::PollResult;
use serde_json::{json, Value};
use std::fmt::Write;

/// Switch state as it appears in JSON: `true` or `{"1": true, ...}`
fn switch_compact(state: &SwitchState) -> String {
    serde_json::to_string(state).unwrap_or_default()
}

fn switch_text(state: &SwitchState) -> String {
    match state {
        SwitchState::Single(on) => format!("Switch On: {}", on),
        SwitchState::Multi(map) => {
            let switches: Vec<String> = map.iter().map(|(dp, on)| format!("{}: {}", dp, on)).collect();
            format!("Switches ({}) On: {{{}}}", map.len(), switches.join(", "))
        }
    }
}

/// Detailed report for one polled device
pub fn format_poll(device_id: &str, address: &str, key: &str, version: &str, result: &PollResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Device {} at {} key {} protocol {}:", device_id, address, key, version);
    let _ = writeln!(out, "    {}", switch_text(&result.switch_state));
    match &result.power {
        Some(power) if !result.status.is_error() => {
            let usage = power.projected_usage();
            let _ = writeln!(out, "    Power (W): {:.6}", power.watts);
            let _ = writeln!(out, "    Current (mA): {:.6}", power.milliamps);
            let _ = writeln!(out, "    Voltage (V): {:.6}", power.volts);
            let _ = writeln!(
                out,
                "    Projected usage (kWh):  Day: {:.6} Week: {:.6}  Month: {:.6}",
                usage.day_kwh, usage.week_kwh, usage.month_kwh
            );
        }
        _ => {
            let _ = writeln!(out, "    NOTE: {}", result.status);
        }
    }
    out
}

/// JSON document for one polled device
pub fn poll_json(result: &PollResult, now: DateTime<Utc>) -> Value {
    let (watts, milliamps, volts) = result
        .power
        .map(|p| (p.watts, p.milliamps, p.volts))
        .unwrap_or((0.0, 0.0, 0.0));
    json!({
        "datetime": now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "switch": result.switch_state,
        "power": watts,
        "current": milliamps,
        "voltage": volts,
        "response": result.status.to_string(),
    })
}

fn device_line(record: &DeviceRecord) -> String {
    let id = record.device_id.as_deref().unwrap_or("?");
    let version = record
        .protocol_version
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!("Device at {}: ID {}, version {}", record.network_address, id, version);

    if let Some(status) = &record.poll_status {
        let state = record
            .switch_state
            .as_ref()
            .map(switch_compact)
            .unwrap_or_default();
        match &record.power {
            Some(p) => {
                let _ = write!(
                    line,
                    ", state={}, W={}, mA={}, V={} [{}]",
                    state, p.watts, p.milliamps, p.volts, status
                );
            }
            None => {
                let _ = write!(line, ", state={} [{}]", state, status);
            }
        }
    } else if record.decode_status != DecodeStatus::Valid {
        let _ = write!(line, " [{:?} beacon]", record.decode_status);
    }
    line
}

/// Progress line for a scan event, if it is worth showing
pub fn format_event(event: &ScanEvent) -> Option<String> {
    match event {
        ScanEvent::ScanStarted { max_retries } => Some(format!(
            "Scanning for devices ({} retries)...",
            max_retries
        )),
        ScanEvent::DeviceFound(record) => {
            let mut line = format!("FOUND {}", device_line(record));
            if record.protocol_version.as_ref().is_some_and(|v| v.is_encrypted()) {
                line.push_str("\n    Device Key required to poll for stats");
            }
            Some(line)
        }
        ScanEvent::DevicePolled(record) => Some(format!("    Stats: {}", device_line(record))),
        ScanEvent::DeviceRediscovered { .. } => None,
        ScanEvent::ScanCompleted { found, interrupted } => Some(if *interrupted {
            format!("Scan interrupted. Found {} devices.", found)
        } else {
            format!("Scan Complete!  Found {} devices.", found)
        }),
    }
}

/// One line per device found by a scan
pub fn format_scan(report: &ScanReport) -> String {
    let mut out = String::new();
    for record in report.devices.values() {
        let _ = writeln!(out, "{}", device_line(record));
    }
    out
}
