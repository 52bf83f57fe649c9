//! Configuration loading

use anyhow::{bail, Result};
use plugscan_discovery::{ListenerConfig, ScannerConfig, DEFAULT_MAX_RETRIES};
use plugscan_telemetry::{RetryPolicy, TcpSessionFactory};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Address the beacon sockets bind to
    #[serde(default = "default_bind")]
    pub bind: Ipv4Addr,
    /// Plaintext beacon port
    #[serde(default = "default_plain_port")]
    pub plain_port: u16,
    /// Encrypted beacon port
    #[serde(default = "default_encrypted_port")]
    pub encrypted_port: u16,
    /// Seconds to wait for a beacon on one port
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: f64,
    /// Combined miss count before the scan stops
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Poll protocol 3.1 devices as they are found
    #[serde(default = "default_true")]
    pub auto_poll: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            plain_port: default_plain_port(),
            encrypted_port: default_encrypted_port(),
            receive_timeout_secs: default_receive_timeout(),
            max_retries: default_max_retries(),
            auto_poll: true,
        }
    }
}

fn default_bind() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_plain_port() -> u16 {
    6666
}

fn default_encrypted_port() -> u16 {
    6667
}

fn default_receive_timeout() -> f64 {
    3.0
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Failures of one kind tolerated per poll
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Seconds between attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    /// Growth factor for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for exponential backoff in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// TCP port devices answer status queries on
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    /// Connect/read timeout for one status query
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            retry_delay_secs: default_retry_delay(),
            backoff: default_backoff(),
            backoff_factor: default_backoff_factor(),
            max_delay_secs: default_max_delay(),
            session_port: default_session_port(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

fn default_retry_limit() -> u32 {
    5
}

fn default_retry_delay() -> f64 {
    2.0
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_session_port() -> u16 {
    6668
}

fn default_session_timeout() -> f64 {
    5.0
}

fn secs(field: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a non-negative number of seconds, got {}", field, value);
    }
    Ok(Duration::from_secs_f64(value))
}

impl Config {
    /// Convert to ScannerConfig
    pub fn to_scanner_config(&self) -> Result<ScannerConfig> {
        Ok(ScannerConfig {
            listener: ListenerConfig {
                bind: self.scan.bind,
                plain_port: self.scan.plain_port,
                encrypted_port: self.scan.encrypted_port,
                receive_timeout: secs("scan.receive_timeout_secs", self.scan.receive_timeout_secs)?,
            },
            auto_poll: self.scan.auto_poll,
        })
    }

    /// Convert to the poller's RetryPolicy
    pub fn to_retry_policy(&self) -> Result<RetryPolicy> {
        let delay = secs("poll.retry_delay_secs", self.poll.retry_delay_secs)?;
        Ok(match self.poll.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.poll.retry_limit, delay),
            BackoffKind::Exponential => RetryPolicy::exponential(
                self.poll.retry_limit,
                delay,
                self.poll.backoff_factor,
                secs("poll.max_delay_secs", self.poll.max_delay_secs)?,
            ),
        })
    }

    pub fn to_session_factory(&self) -> Result<TcpSessionFactory> {
        Ok(TcpSessionFactory {
            port: self.poll.session_port,
            timeout: secs("poll.session_timeout_secs", self.poll.session_timeout_secs)?,
        })
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugscan_telemetry::Backoff;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.scan.max_retries, 15);
        assert_eq!(config.scan.plain_port, 6666);
        assert_eq!(config.scan.encrypted_port, 6667);
        assert!(config.scan.auto_poll);

        let policy = config.to_retry_policy().unwrap();
        assert_eq!(policy, RetryPolicy::fixed(5, Duration::from_secs(2)));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugscan.toml");
        std::fs::write(
            &path,
            "[scan]\nmax_retries = 4\nreceive_timeout_secs = 0.5\n\n[poll]\nbackoff = \"exponential\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.scan.max_retries, 4);
        assert_eq!(config.poll.session_port, 6668);

        let scanner = config.to_scanner_config().unwrap();
        assert_eq!(scanner.listener.receive_timeout, Duration::from_millis(500));
        assert_eq!(scanner.listener.plain_port, 6666);

        let policy = config.to_retry_policy().unwrap();
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                factor: 2.0,
                max_delay: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugscan.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        let factory = config.to_session_factory().unwrap();
        assert_eq!(factory.port, 6668);
        assert_eq!(factory.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut config = Config::default();
        config.scan.receive_timeout_secs = -1.0;
        assert!(config.to_scanner_config().is_err());
    }
}
