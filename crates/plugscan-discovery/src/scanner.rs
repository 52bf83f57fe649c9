//! Scan loop and device registry
//!
//! The loop alternates between the two beacon ports, always listening on the
//! one with fewer misses. Silence and re-sightings count as misses, a new
//! device takes one miss back, and the scan stops once the combined miss
//! count exceeds the configured limit.

use plugscan_core::{BeaconPort, DeviceRecord, PollStatus, ProtocolVersion};
use plugscan_telemetry::TelemetryPoller;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{DecodedBeacon, FrameCodec};
use crate::listener::{BroadcastListener, DatagramSource, ListenerConfig, ListenerError, Received};

/// Combined miss count a scan tolerates before stopping
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub listener: ListenerConfig,
    /// Poll newly found protocol 3.1 devices straight away
    pub auto_poll: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            auto_poll: true,
        }
    }
}

/// Per-port miss counters driving port choice and the stop condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    pub plain_miss: u32,
    pub encrypted_miss: u32,
}

impl ScanCounters {
    /// Port to listen on next; ties go to the plaintext port
    pub fn next_port(&self) -> BeaconPort {
        if self.plain_miss <= self.encrypted_miss {
            BeaconPort::Plain
        } else {
            BeaconPort::Encrypted
        }
    }

    pub fn record_miss(&mut self, port: BeaconPort) {
        match port {
            BeaconPort::Plain => self.plain_miss += 1,
            BeaconPort::Encrypted => self.encrypted_miss += 1,
        }
    }

    pub fn record_discovery(&mut self, port: BeaconPort) {
        match port {
            BeaconPort::Plain => self.plain_miss = self.plain_miss.saturating_sub(1),
            BeaconPort::Encrypted => self.encrypted_miss = self.encrypted_miss.saturating_sub(1),
        }
    }

    pub fn total(&self) -> u32 {
        self.plain_miss + self.encrypted_miss
    }

    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.total() > max_retries
    }
}

/// Events emitted while a scan runs
#[derive(Debug, Clone)]
pub enum ScanEvent {
    ScanStarted { max_retries: u32 },
    DeviceFound(DeviceRecord),
    DeviceRediscovered { address: String, port: BeaconPort },
    DevicePolled(DeviceRecord),
    ScanCompleted { found: usize, interrupted: bool },
}

/// Everything a finished scan learned
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub devices: BTreeMap<String, DeviceRecord>,
    pub counters: ScanCounters,
    pub iterations: u32,
    pub interrupted: bool,
}

/// Whether a beacon came from an address seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Known,
}

/// Devices seen during one scan, keyed by network address
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded beacon. Known addresses are only touched, never replaced.
    pub fn observe(&mut self, beacon: &DecodedBeacon) -> Observation {
        let address = beacon.address();
        if let Some(existing) = self.devices.get_mut(address) {
            existing.touch();
            return Observation::Known;
        }

        let record = match beacon {
            DecodedBeacon::Valid(frame) => DeviceRecord::new(
                frame.network_address.clone(),
                frame.device_id.clone(),
                frame.device_key.clone(),
                frame.protocol_version.clone(),
            ),
            other => DeviceRecord::unidentified(address, other.status()),
        };
        self.devices.insert(address.to_string(), record);
        Observation::New
    }

    pub fn get(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> BTreeMap<String, DeviceRecord> {
        self.devices
    }
}

/// Port a beacon's miss or discovery is charged to
fn attributed_port(beacon: &DecodedBeacon, polled: BeaconPort) -> BeaconPort {
    beacon
        .version()
        .map(ProtocolVersion::beacon_port)
        .unwrap_or(polled)
}

/// Runs discovery scans
pub struct DiscoveryScanner {
    config: ScannerConfig,
    codec: FrameCodec,
    poller: Option<TelemetryPoller>,
    event_tx: broadcast::Sender<ScanEvent>,
}

impl DiscoveryScanner {
    pub fn new(config: ScannerConfig, poller: Option<TelemetryPoller>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            codec: FrameCodec::default(),
            poller,
            event_tx,
        }
    }

    /// Subscribe to scan events
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Bind the beacon ports and scan until the miss limit is exceeded or
    /// `cancel` fires. Only binding can fail.
    pub async fn run_scan(
        &self,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScanReport> {
        let mut listener = BroadcastListener::bind(&self.config.listener)?;
        Ok(self.run_with_source(&mut listener, max_retries, cancel).await)
    }

    /// Scan using an arbitrary datagram source
    pub async fn run_with_source<S: DatagramSource>(
        &self,
        source: &mut S,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> ScanReport {
        let _ = self.event_tx.send(ScanEvent::ScanStarted { max_retries });
        info!(max_retries = max_retries, "Starting discovery scan");

        let mut registry = DeviceRegistry::new();
        let mut counters = ScanCounters::default();
        let mut iterations = 0u32;
        let mut interrupted = false;

        while !counters.exhausted(max_retries) {
            iterations += 1;
            let port = counters.next_port();

            let raw = match source.receive_next(port, cancel).await {
                Ok(Received::Datagram(raw)) => raw,
                Ok(Received::Timeout) => {
                    counters.record_miss(port);
                    debug!(port = %port, misses = counters.total(), "Timeout waiting for beacon");
                    continue;
                }
                Err(ListenerError::Interrupted) => {
                    info!("CANCEL: scan interrupted by user");
                    interrupted = true;
                    break;
                }
                Err(e) => {
                    warn!(port = %port, error = %e, "Receive error, counting as miss");
                    counters.record_miss(port);
                    continue;
                }
            };

            let beacon = self.codec.decode(&raw);
            let charged = attributed_port(&beacon, port);

            match registry.observe(&beacon) {
                Observation::Known => {
                    counters.record_miss(charged);
                    debug!(ip = %beacon.address(), port = %charged, "Device already known");
                    let _ = self.event_tx.send(ScanEvent::DeviceRediscovered {
                        address: beacon.address().to_string(),
                        port: charged,
                    });
                }
                Observation::New => {
                    counters.record_discovery(charged);
                    info!(
                        ip = %beacon.address(),
                        status = ?beacon.status(),
                        version = ?beacon.version(),
                        "Found device"
                    );
                    if let Some(record) = registry.get(beacon.address()) {
                        let _ = self.event_tx.send(ScanEvent::DeviceFound(record.clone()));
                    }

                    if let DecodedBeacon::Valid(frame) = &beacon {
                        if frame.protocol_version == ProtocolVersion::V31 && self.config.auto_poll {
                            if let Some(poller) = &self.poller {
                                let result = poller
                                    .poll(
                                        &frame.device_id,
                                        &frame.network_address,
                                        &frame.device_key,
                                        &frame.protocol_version,
                                        cancel,
                                    )
                                    .await;
                                let was_interrupted = result.status == PollStatus::UserInterrupt;

                                if let Some(record) = registry.get_mut(&frame.network_address) {
                                    record.apply_poll(result.switch_state, result.power, result.status);
                                    let _ = self.event_tx.send(ScanEvent::DevicePolled(record.clone()));
                                }

                                if was_interrupted {
                                    interrupted = true;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        if registry.is_empty() {
            info!(iterations = iterations, interrupted = interrupted, "Scan found no devices");
        } else {
            info!(
                found = registry.len(),
                iterations = iterations,
                interrupted = interrupted,
                "Scan completed"
            );
        }
        let _ = self.event_tx.send(ScanEvent::ScanCompleted {
            found: registry.len(),
            interrupted,
        });

        ScanReport {
            devices: registry.into_devices(),
            counters,
            iterations,
            interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawDatagram;
    use async_trait::async_trait;
    use plugscan_core::{DecodeStatus, SwitchState};
    use plugscan_telemetry::{DeviceSession, SessionError, SessionFactory};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Replays a fixed sequence of receive outcomes, then times out forever
    struct ScriptedSource {
        script: VecDeque<Result<Received, ListenerError>>,
        requested: Vec<BeaconPort>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Received, ListenerError>>) -> Self {
            Self {
                script: script.into(),
                requested: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl DatagramSource for ScriptedSource {
        async fn receive_next(
            &mut self,
            port: BeaconPort,
            cancel: &CancellationToken,
        ) -> Result<Received, ListenerError> {
            if cancel.is_cancelled() {
                return Err(ListenerError::Interrupted);
            }
            self.requested.push(port);
            self.script.pop_front().unwrap_or(Ok(Received::Timeout))
        }
    }

    fn beacon(ip: &str, version: &str) -> Result<Received, ListenerError> {
        let json = json!({
            "ip": ip,
            "gwId": format!("dev-{}", ip),
            "productKey": "keyabcdefgh12345",
            "version": version,
        });
        let encrypted = version != "3.1";
        let port = if encrypted {
            BeaconPort::Encrypted
        } else {
            BeaconPort::Plain
        };
        Ok(Received::Datagram(RawDatagram {
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)),
            payload: FrameCodec::default().encode_beacon(&json, encrypted),
            port,
        }))
    }

    fn timeout() -> Result<Received, ListenerError> {
        Ok(Received::Timeout)
    }

    struct StubSession {
        calls: Arc<AtomicU32>,
        response: Value,
        cancel_on_query: Option<CancellationToken>,
    }

    #[async_trait]
    impl DeviceSession for StubSession {
        fn set_protocol_version(&mut self, _version: &ProtocolVersion) {}

        async fn status(&mut self) -> Result<Value, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_query {
                cancel.cancel();
                return Err(SessionError::NotReachable("stub".to_string()));
            }
            Ok(self.response.clone())
        }
    }

    struct StubFactory {
        calls: Arc<AtomicU32>,
        response: Value,
        cancel_on_query: Option<CancellationToken>,
    }

    impl SessionFactory for StubFactory {
        fn open(&self, _device_id: &str, _address: &str, _key: &str) -> Box<dyn DeviceSession> {
            Box::new(StubSession {
                calls: self.calls.clone(),
                response: self.response.clone(),
                cancel_on_query: self.cancel_on_query.clone(),
            })
        }
    }

    fn stub_poller(
        response: Value,
        cancel_on_query: Option<CancellationToken>,
    ) -> (TelemetryPoller, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let factory = StubFactory {
            calls: calls.clone(),
            response,
            cancel_on_query,
        };
        (TelemetryPoller::new(Arc::new(factory)), calls)
    }

    #[test]
    fn test_counters_prefer_plain_on_tie() {
        let mut counters = ScanCounters::default();
        assert_eq!(counters.next_port(), BeaconPort::Plain);
        counters.record_miss(BeaconPort::Plain);
        assert_eq!(counters.next_port(), BeaconPort::Encrypted);
        counters.record_miss(BeaconPort::Encrypted);
        assert_eq!(counters.next_port(), BeaconPort::Plain);
    }

    #[test]
    fn test_discovery_floors_at_zero() {
        let mut counters = ScanCounters::default();
        counters.record_discovery(BeaconPort::Encrypted);
        assert_eq!(counters.encrypted_miss, 0);
        counters.record_miss(BeaconPort::Encrypted);
        counters.record_miss(BeaconPort::Encrypted);
        counters.record_discovery(BeaconPort::Encrypted);
        assert_eq!(counters.encrypted_miss, 1);
        assert!(!counters.exhausted(1));
        counters.record_miss(BeaconPort::Plain);
        assert!(counters.exhausted(1));
    }

    #[tokio::test]
    async fn test_silent_network_stops_after_limit() {
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), None);
        let mut source = ScriptedSource::new(vec![]);
        let report = scanner
            .run_with_source(&mut source, 3, &CancellationToken::new())
            .await;

        assert_eq!(report.iterations, 4);
        assert_eq!(
            report.counters,
            ScanCounters {
                plain_miss: 2,
                encrypted_miss: 2
            }
        );
        assert!(report.devices.is_empty());
        assert!(!report.interrupted);
        assert_eq!(
            source.requested,
            vec![
                BeaconPort::Plain,
                BeaconPort::Encrypted,
                BeaconPort::Plain,
                BeaconPort::Encrypted
            ]
        );
    }

    #[tokio::test]
    async fn test_new_devices_take_back_misses() {
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), None);
        let mut source = ScriptedSource::new(vec![
            beacon("10.0.1.10", "3.1"),
            timeout(),
            beacon("10.0.1.11", "3.3"),
            timeout(),
            timeout(),
        ]);
        let report = scanner
            .run_with_source(&mut source, 2, &CancellationToken::new())
            .await;

        assert_eq!(report.iterations, 5);
        assert_eq!(report.devices.len(), 2);
        assert_eq!(
            report.counters,
            ScanCounters {
                plain_miss: 2,
                encrypted_miss: 1
            }
        );
        assert_eq!(
            source.requested,
            vec![
                BeaconPort::Plain,
                BeaconPort::Plain,
                BeaconPort::Encrypted,
                BeaconPort::Encrypted,
                BeaconPort::Plain
            ]
        );

        let encrypted = &report.devices["10.0.1.11"];
        assert_eq!(encrypted.protocol_version, Some(ProtocolVersion::V33));
        assert!(encrypted.power.is_none());
        assert!(encrypted.last_error.is_none());
    }

    #[tokio::test]
    async fn test_repeated_beacons_do_not_duplicate_records() {
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), None);
        let mut events = scanner.subscribe();
        let mut source = ScriptedSource::new(vec![
            beacon("10.0.1.10", "3.1"),
            beacon("10.0.1.10", "3.1"),
            beacon("10.0.1.10", "3.1"),
        ]);
        let report = scanner
            .run_with_source(&mut source, 1, &CancellationToken::new())
            .await;

        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.devices["10.0.1.10"].sightings, 3);
        // Both re-sightings are charged to the plaintext port
        assert_eq!(report.counters.plain_miss, 2);
        assert_eq!(report.iterations, 3);

        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::ScanStarted { max_retries: 1 }
        ));
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::DeviceFound(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ScanEvent::DeviceRediscovered { port: BeaconPort::Plain, .. }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_beacon_is_recorded_against_sender() {
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), None);
        let mut source = ScriptedSource::new(vec![Ok(Received::Datagram(RawDatagram {
            source: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 77)),
            payload: vec![1, 2, 3],
            port: BeaconPort::Plain,
        }))]);
        let report = scanner
            .run_with_source(&mut source, 0, &CancellationToken::new())
            .await;

        let record = &report.devices["10.0.1.77"];
        assert_eq!(record.decode_status, DecodeStatus::Malformed);
        assert!(record.device_id.is_none());
    }

    #[tokio::test]
    async fn test_new_plaintext_device_is_polled() {
        let (poller, calls) = stub_poller(
            json!({"dps": {"1": true, "19": "356", "18": "1200", "20": "2300"}}),
            None,
        );
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), Some(poller));
        let mut source = ScriptedSource::new(vec![
            beacon("10.0.1.10", "3.1"),
            beacon("10.0.1.11", "3.3"),
        ]);
        let report = scanner
            .run_with_source(&mut source, 2, &CancellationToken::new())
            .await;

        // Only the 3.1 device is queried
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let plain = &report.devices["10.0.1.10"];
        assert_eq!(plain.poll_status, Some(PollStatus::Ok));
        assert_eq!(plain.switch_state, Some(SwitchState::Single(true)));
        let power = plain.power.as_ref().unwrap();
        assert!((power.watts - 35.6).abs() < 1e-9);
        assert!((power.volts - 230.0).abs() < 1e-9);

        let encrypted = &report.devices["10.0.1.11"];
        assert!(!encrypted.is_polled());
    }

    #[tokio::test]
    async fn test_auto_poll_disabled() {
        let (poller, calls) = stub_poller(json!({"dps": {"1": true}}), None);
        let config = ScannerConfig {
            auto_poll: false,
            ..ScannerConfig::default()
        };
        let scanner = DiscoveryScanner::new(config, Some(poller));
        let mut source = ScriptedSource::new(vec![beacon("10.0.1.10", "3.1")]);
        let report = scanner
            .run_with_source(&mut source, 1, &CancellationToken::new())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!report.devices["10.0.1.10"].is_polled());
    }

    #[tokio::test]
    async fn test_cancel_during_receive_returns_partial_report() {
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), None);
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::new(vec![
            beacon("10.0.1.10", "3.1"),
            Err(ListenerError::Interrupted),
        ]);
        let report = scanner.run_with_source(&mut source, 15, &cancel).await;

        assert!(report.interrupted);
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_polling_ends_scan() {
        let cancel = CancellationToken::new();
        let (poller, calls) = stub_poller(Value::Null, Some(cancel.clone()));
        let scanner = DiscoveryScanner::new(ScannerConfig::default(), Some(poller));
        let mut source = ScriptedSource::new(vec![
            beacon("10.0.1.10", "3.1"),
            beacon("10.0.1.11", "3.1"),
        ]);
        let report = scanner.run_with_source(&mut source, 15, &cancel).await;

        assert!(report.interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.devices.len(), 1);
        let record = &report.devices["10.0.1.10"];
        assert_eq!(record.poll_status, Some(PollStatus::UserInterrupt));
        assert_eq!(record.last_error.as_deref(), Some("User Interrupt"));
    }
}
