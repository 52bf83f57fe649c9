//! Plugscan Telemetry - Status polling for discovered plugs
//!
//! This crate defines the device session seam, a plaintext protocol 3.1
//! TCP session, the retry policy used around it, and the poller that turns
//! a raw status response into switch and power readings.

pub mod poller;
pub mod retry;
pub mod session;
pub mod transport;

pub use poller::{extract_readings, ExtractError, PollResult, TelemetryPoller, RETRY_DELAY, RETRY_LIMIT};
pub use retry::{Backoff, Interrupted, RetryBudget, RetryDecision, RetryError, RetryPolicy};
pub use session::{DeviceSession, SessionError, SessionFactory, TcpSession, TcpSessionFactory, SESSION_PORT};
pub use transport::{Frame, TcpTransport};
