//! Async TCP transport for the plug wire framing
//!
//! Every message is framed as:
//!
//! ```text
//! 0x000055AA | seq (u32) | command (u32) | length (u32) | [return code (u32)] | payload | crc32 (u32) | 0x0000AA55
//! ```
//!
//! All integers are big-endian. `length` counts everything after the 16-byte
//! header, trailer included. Frames sent by devices carry a return code in
//! front of the payload; the UDP discovery beacons use the same layout.

use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;

/// Prefix, sequence number, command and length
pub const HEADER_LEN: usize = 16;
/// CRC and suffix
pub const TRAILER_LEN: usize = 8;
pub const RETCODE_LEN: usize = 4;

/// Largest frame body accepted from a device
const MAX_BODY_LEN: usize = 64 * 1024;

/// Command codes used by this workspace
pub mod command {
    /// Plaintext discovery beacon
    pub const UDP: u32 = 0x00;
    /// Status query
    pub const DP_QUERY: u32 = 0x0a;
    /// Encrypted discovery beacon
    pub const UDP_NEW: u32 = 0x13;
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub command: u32,
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
}

/// Encode a frame, optionally with a return code in front of the payload
pub fn encode_frame(seq: u32, command: u32, retcode: Option<u32>, payload: &[u8]) -> Vec<u8> {
    let retcode_len = if retcode.is_some() { RETCODE_LEN } else { 0 };
    let body_len = retcode_len + payload.len() + TRAILER_LEN;

    let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
    frame.extend_from_slice(&PREFIX.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&command.to_be_bytes());
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    if let Some(rc) = retcode {
        frame.extend_from_slice(&rc.to_be_bytes());
    }
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&SUFFIX.to_be_bytes());
    frame
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decode the header, returning (seq, command, body length)
pub fn decode_header(data: &[u8]) -> Result<(u32, u32, usize)> {
    if data.len() < HEADER_LEN {
        anyhow::bail!("Header too short: {} bytes", data.len());
    }
    let prefix = read_u32(data, 0);
    if prefix != PREFIX {
        anyhow::bail!("Bad frame prefix: {:#010x}", prefix);
    }
    let seq = read_u32(data, 4);
    let command = read_u32(data, 8);
    let body_len = read_u32(data, 12) as usize;
    if body_len < TRAILER_LEN || body_len > MAX_BODY_LEN {
        anyhow::bail!("Invalid frame length: {}", body_len);
    }
    Ok((seq, command, body_len))
}

/// Decode a complete frame received from a device
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    let (seq, command, body_len) = decode_header(data)?;
    let total = HEADER_LEN + body_len;
    if data.len() < total {
        anyhow::bail!(
            "Frame truncated: expected {} bytes, got {}",
            total,
            data.len()
        );
    }

    let crc_offset = total - TRAILER_LEN;
    let suffix = read_u32(data, crc_offset + 4);
    if suffix != SUFFIX {
        anyhow::bail!("Bad frame suffix: {:#010x}", suffix);
    }
    let expected_crc = read_u32(data, crc_offset);
    let actual_crc = crc32fast::hash(&data[..crc_offset]);
    if expected_crc != actual_crc {
        anyhow::bail!(
            "CRC mismatch: expected {:#010x}, got {:#010x}",
            expected_crc,
            actual_crc
        );
    }

    let body = &data[HEADER_LEN..crc_offset];
    // A leading word with only the low byte set is a return code, not payload
    let (retcode, payload) = if body.len() >= RETCODE_LEN && read_u32(body, 0) & 0xFFFF_FF00 == 0 {
        (Some(read_u32(body, 0)), &body[RETCODE_LEN..])
    } else {
        (None, body)
    };

    Ok(Frame {
        seq,
        command,
        retcode,
        payload: payload.to_vec(),
    })
}

/// Async TCP transport to a single device
pub struct TcpTransport {
    stream: TcpStream,
    target: String,
    timeout: Duration,
    seq: u32,
}

impl TcpTransport {
    /// Connect to a device
    pub async fn connect(host: &str, port: u16, timeout_dur: Duration) -> Result<Self> {
        let target = format!("{}:{}", host, port);
        let stream = timeout(timeout_dur, TcpStream::connect(&target)).await??;
        stream.set_nodelay(true)?;
        debug!(addr = %target, "Connected to device");

        Ok(Self {
            stream,
            target,
            timeout: timeout_dur,
            seq: 1,
        })
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Send a request and wait for one response frame
    pub async fn transceive(&mut self, command: u32, payload: &[u8]) -> Result<Frame> {
        let seq = self.next_seq();
        let packet = encode_frame(seq, command, None, payload);

        trace!(
            addr = %self.target,
            command = command,
            seq = seq,
            payload_len = payload.len(),
            "Sending request"
        );

        timeout(self.timeout, self.stream.write_all(&packet)).await??;

        let mut header = [0u8; HEADER_LEN];
        timeout(self.timeout, self.stream.read_exact(&mut header)).await??;
        let (_, _, body_len) = decode_header(&header)?;

        let mut data = Vec::with_capacity(HEADER_LEN + body_len);
        data.extend_from_slice(&header);
        data.resize(HEADER_LEN + body_len, 0);
        timeout(self.timeout, self.stream.read_exact(&mut data[HEADER_LEN..])).await??;

        let frame = decode_frame(&data)?;

        debug!(
            command = frame.command,
            seq = frame.seq,
            retcode = ?frame.retcode,
            payload_len = frame.payload.len(),
            "Received response"
        );

        if frame.command != command {
            anyhow::bail!(
                "Command mismatch: expected {:#x}, got {:#x}",
                command,
                frame.command
            );
        }

        Ok(frame)
    }
}
