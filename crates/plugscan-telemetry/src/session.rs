//! Device sessions: the seam between the poller and the wire

use async_trait::async_trait;
use plugscan_core::ProtocolVersion;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::transport::{command, TcpTransport};

/// Default TCP port devices answer status queries on
pub const SESSION_PORT: u16 = 6668;

/// Default timeout for connect, send and receive
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device not reachable at {0}")]
    NotReachable(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Protocol version {0} is not supported by this session")]
    Unsupported(String),
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// A query session with one device
#[async_trait]
pub trait DeviceSession: Send {
    /// Switch the session to another protocol version before querying
    fn set_protocol_version(&mut self, version: &ProtocolVersion);

    /// Query the device status, returning `{"dps": {...}}` on success
    async fn status(&mut self) -> Result<Value, SessionError>;
}

/// Opens sessions for discovered devices
pub trait SessionFactory: Send + Sync {
    fn open(&self, device_id: &str, address: &str, key: &str) -> Box<dyn DeviceSession>;
}

/// Plaintext protocol 3.1 session over TCP
#[derive(Debug, Clone)]
pub struct TcpSession {
    device_id: String,
    address: String,
    port: u16,
    timeout: Duration,
    version: ProtocolVersion,
}

impl TcpSession {
    pub fn new(device_id: &str, address: &str, port: u16, timeout: Duration) -> Self {
        Self {
            device_id: device_id.to_string(),
            address: address.to_string(),
            port,
            timeout,
            version: ProtocolVersion::V31,
        }
    }

    fn query_payload(&self) -> Vec<u8> {
        serde_json::json!({
            "gwId": self.device_id,
            "devId": self.device_id,
        })
        .to_string()
        .into_bytes()
    }
}

#[async_trait]
impl DeviceSession for TcpSession {
    fn set_protocol_version(&mut self, version: &ProtocolVersion) {
        self.version = version.clone();
    }

    async fn status(&mut self) -> Result<Value, SessionError> {
        if self.version.is_encrypted() {
            return Err(SessionError::Unsupported(self.version.to_string()));
        }

        let mut transport = TcpTransport::connect(&self.address, self.port, self.timeout)
            .await
            .map_err(|e| {
                debug!(ip = %self.address, error = %e, "Connect failed");
                SessionError::NotReachable(format!("{}:{}", self.address, self.port))
            })?;

        let frame = transport
            .transceive(command::DP_QUERY, &self.query_payload())
            .await?;

        if let Some(rc) = frame.retcode.filter(|rc| *rc != 0) {
            return Err(SessionError::InvalidResponse(format!(
                "device returned code {}",
                rc
            )));
        }

        let text = String::from_utf8_lossy(&frame.payload);
        let text = text.trim_matches(char::from(0)).trim();
        if text.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(text).map_err(|e| SessionError::InvalidResponse(e.to_string()))
    }
}

/// Creates [`TcpSession`]s with shared port and timeout settings
#[derive(Debug, Clone)]
pub struct TcpSessionFactory {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpSessionFactory {
    fn default() -> Self {
        Self {
            port: SESSION_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SessionFactory for TcpSessionFactory {
    // Protocol 3.1 queries are plaintext, so the device key is not needed
    fn open(&self, device_id: &str, address: &str, _key: &str) -> Box<dyn DeviceSession> {
        Box::new(TcpSession::new(device_id, address, self.port, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{decode_header, encode_frame, HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let (seq, command, body_len) = decode_header(&header).unwrap();
            let mut body = vec![0u8; body_len];
            socket.read_exact(&mut body).await.unwrap();
            let request: Value = serde_json::from_slice(&body[..body_len - 8]).unwrap();

            socket
                .write_all(&encode_frame(seq, command, Some(0), reply))
                .await
                .unwrap();
            request
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (port, device) = serve_once(br#"{"devId":"abc","dps":{"1":true,"5":120}}"#).await;
        let mut session = TcpSession::new("abc", "127.0.0.1", port, Duration::from_secs(2));

        let status = session.status().await.unwrap();
        assert_eq!(status["dps"]["1"], Value::Bool(true));

        let request = device.await.unwrap();
        assert_eq!(request["gwId"], "abc");
        assert_eq!(request["devId"], "abc");
    }

    #[tokio::test]
    async fn test_empty_payload_is_null() {
        let (port, device) = serve_once(b"").await;
        let mut session = TcpSession::new("abc", "127.0.0.1", port, Duration::from_secs(2));
        assert_eq!(session.status().await.unwrap(), Value::Null);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_encrypted_version_is_unsupported() {
        let factory = TcpSessionFactory::default();
        let mut session = factory.open("abc", "127.0.0.1", "key");
        session.set_protocol_version(&ProtocolVersion::V33);
        assert!(matches!(
            session.status().await,
            Err(SessionError::Unsupported(v)) if v == "3.3"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut session = TcpSession::new("abc", "127.0.0.1", port, Duration::from_millis(500));
        assert!(matches!(
            session.status().await,
            Err(SessionError::NotReachable(_))
        ));
    }
}
