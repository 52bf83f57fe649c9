//! Dual-port UDP broadcast listener
//!
//! Uses SO_REUSEPORT so other beacon listeners on the same host keep working.

use async_trait::async_trait;
use plugscan_core::BeaconPort;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::codec::RawDatagram;

/// Plaintext beacon port (protocol 3.1)
pub const PLAIN_PORT: u16 = 6666;

/// Encrypted beacon port (protocol 3.3+)
pub const ENCRYPTED_PORT: u16 = 6667;

/// How long one receive waits for a beacon
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_DATAGRAM: usize = 4096;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Receive failed on {port} port: {source}")]
    Receive {
        port: BeaconPort,
        #[source]
        source: std::io::Error,
    },
    #[error("Interrupted by user")]
    Interrupted,
}

/// Result of waiting for one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Datagram(RawDatagram),
    /// Nothing arrived within the receive window
    Timeout,
}

/// Anything the scan loop can pull beacons from
#[async_trait]
pub trait DatagramSource: Send {
    async fn receive_next(
        &mut self,
        port: BeaconPort,
        cancel: &CancellationToken,
    ) -> Result<Received, ListenerError>;
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub bind: Ipv4Addr,
    pub plain_port: u16,
    pub encrypted_port: u16,
    pub receive_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED,
            plain_port: PLAIN_PORT,
            encrypted_port: ENCRYPTED_PORT,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }
}

/// Create a UDP socket that can receive broadcasts alongside other listeners
pub fn create_broadcast_socket(bind: Ipv4Addr, port: u16) -> Result<std::net::UdpSocket, std::io::Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_broadcast(true)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(bind, port));
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

fn bind_port(bind: Ipv4Addr, port: u16) -> Result<UdpSocket, ListenerError> {
    create_broadcast_socket(bind, port)
        .and_then(UdpSocket::from_std)
        .map_err(|source| ListenerError::Bind { port, source })
}

/// Owns the plaintext and encrypted beacon sockets; both close on drop
pub struct BroadcastListener {
    plain: UdpSocket,
    encrypted: UdpSocket,
    receive_timeout: Duration,
    buf: Vec<u8>,
}

impl BroadcastListener {
    /// Bind both beacon ports. Must be called from within a tokio runtime.
    pub fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let plain = bind_port(config.bind, config.plain_port)?;
        let encrypted = bind_port(config.bind, config.encrypted_port)?;

        info!(
            plain_port = config.plain_port,
            encrypted_port = config.encrypted_port,
            "UDP beacon listener bound"
        );

        Ok(Self {
            plain,
            encrypted,
            receive_timeout: config.receive_timeout,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    fn socket(&self, port: BeaconPort) -> &UdpSocket {
        match port {
            BeaconPort::Plain => &self.plain,
            BeaconPort::Encrypted => &self.encrypted,
        }
    }

    /// Local address of one of the sockets (useful when bound to port 0)
    pub fn local_addr(&self, port: BeaconPort) -> Result<SocketAddr, std::io::Error> {
        self.socket(port).local_addr()
    }
}

#[async_trait]
impl DatagramSource for BroadcastListener {
    async fn receive_next(
        &mut self,
        port: BeaconPort,
        cancel: &CancellationToken,
    ) -> Result<Received, ListenerError> {
        let socket = match port {
            BeaconPort::Plain => &self.plain,
            BeaconPort::Encrypted => &self.encrypted,
        };

        let recv_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ListenerError::Interrupted),
            r = timeout(self.receive_timeout, socket.recv_from(&mut self.buf)) => r,
        };

        match recv_result {
            Ok(Ok((len, addr))) => {
                trace!(ip = %addr.ip(), port = %port, len = len, "Datagram received");
                Ok(Received::Datagram(RawDatagram {
                    source: addr.ip(),
                    payload: self.buf[..len].to_vec(),
                    port,
                }))
            }
            Ok(Err(source)) => Err(ListenerError::Receive { port, source }),
            Err(_) => {
                debug!(port = %port, "No beacon within receive window");
                Ok(Received::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(receive_timeout: Duration) -> ListenerConfig {
        ListenerConfig {
            bind: Ipv4Addr::LOCALHOST,
            plain_port: 0,
            encrypted_port: 0,
            receive_timeout,
        }
    }

    #[tokio::test]
    async fn test_receives_on_requested_port() {
        let mut listener = BroadcastListener::bind(&loopback_config(Duration::from_secs(2))).unwrap();
        let target = listener.local_addr(BeaconPort::Encrypted).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"beacon", target).await.unwrap();

        let cancel = CancellationToken::new();
        match listener
            .receive_next(BeaconPort::Encrypted, &cancel)
            .await
            .unwrap()
        {
            Received::Datagram(raw) => {
                assert_eq!(raw.payload, b"beacon".to_vec());
                assert_eq!(raw.port, BeaconPort::Encrypted);
                assert_eq!(raw.source, sender.local_addr().unwrap().ip());
            }
            Received::Timeout => panic!("expected a datagram"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_not_an_error() {
        let mut listener =
            BroadcastListener::bind(&loopback_config(Duration::from_millis(50))).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(
            listener.receive_next(BeaconPort::Plain, &cancel).await.unwrap(),
            Received::Timeout
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_receive() {
        let mut listener = BroadcastListener::bind(&loopback_config(Duration::from_secs(30))).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            listener.receive_next(BeaconPort::Plain, &cancel).await,
            Err(ListenerError::Interrupted)
        ));
    }
}
