//! Plugscan - Main entry point
//!
//! Scans the local network for smart plugs and polls them for power data.

mod config;
mod report;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use plugscan_core::ProtocolVersion;
use plugscan_discovery::{DiscoveryScanner, ScanEvent};
use plugscan_telemetry::{RetryError, TelemetryPoller};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "plugscan")]
#[command(about = "Smart plug discovery and power polling")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plugscan.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Identifies one device to poll
#[derive(clap::Args, Debug)]
struct Target {
    /// Device ID, e.g. 01234567891234567890
    #[arg(env = "PLUGID")]
    id: String,

    /// IP address of the plug, e.g. 10.0.1.99
    #[arg(env = "PLUGIP")]
    ip: String,

    /// Device key
    #[arg(env = "PLUGKEY", default_value = "0123456789abcdef")]
    key: String,

    /// Protocol version announced by the device
    #[arg(env = "PLUGVERS", default_value = "3.1")]
    version: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for device beacons and poll the devices that allow it
    Scan {
        /// Combined miss count before the scan stops
        #[arg(short, long)]
        max_retries: Option<u32>,

        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poll one device for switch state and power data
    Poll {
        #[command(flatten)]
        target: Target,

        /// Print a JSON document instead of the report
        #[arg(long, env = "PLUGJSON")]
        json: bool,
    },
    /// Print a device's raw status response
    Raw {
        #[command(flatten)]
        target: Target,
    },
    /// Write a configuration file with default values
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

/// Cancellation token that fires on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn pollable_version(version: &str) -> Result<ProtocolVersion> {
    let version = ProtocolVersion::from(version);
    if version.is_encrypted() {
        bail!(
            "protocol {} needs an encrypted session; only 3.1 devices can be polled",
            version
        );
    }
    Ok(version)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Plugscan v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig { path } = &args.command {
        config::save_default_config(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    let poller = TelemetryPoller::with_policy(
        Arc::new(config.to_session_factory()?),
        config.to_retry_policy()?,
    );
    let cancel = interrupt_token();

    match args.command {
        Command::Scan { max_retries, json } => {
            let max_retries = max_retries.unwrap_or(config.scan.max_retries);
            let scanner = DiscoveryScanner::new(config.to_scanner_config()?, Some(poller));

            let printer = if json {
                None
            } else {
                let mut events = scanner.subscribe();
                Some(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                if let Some(line) = report::format_event(&event) {
                                    println!("{}", line);
                                }
                                if matches!(event, ScanEvent::ScanCompleted { .. }) {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }))
            };

            let scan_report = scanner.run_scan(max_retries, &cancel).await?;
            drop(scanner);
            if let Some(printer) = printer {
                let _ = printer.await;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&scan_report.devices)?);
            } else if !scan_report.devices.is_empty() {
                println!();
                print!("{}", report::format_scan(&scan_report));
            }
        }
        Command::Poll { target, json } => {
            let version = pollable_version(&target.version)?;
            let result = poller
                .poll(&target.id, &target.ip, &target.key, &version, &cancel)
                .await;

            if json {
                let doc = report::poll_json(&result, chrono::Utc::now());
                println!("{}", doc);
            } else {
                print!(
                    "{}",
                    report::format_poll(&target.id, &target.ip, &target.key, &target.version, &result)
                );
            }
        }
        Command::Raw { target } => {
            let version = pollable_version(&target.version)?;
            match poller
                .poll_raw(&target.id, &target.ip, &target.key, &version, &cancel)
                .await
            {
                Ok(raw) => println!("{}", raw),
                Err(RetryError::Interrupted) => bail!("interrupted by user"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
