//! `weigh`: serial session manager for RFID readers and weighing balances.
//!
//! `weigh run` opens every configured device, stores each event in SQLite
//! and forwards it to the network client until interrupted. Sending SIGHUP
//! re-reads the `[[device]]` entries of the configuration file and applies
//! the difference without touching unchanged devices.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serialport::SerialPortType;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weigh_core::MemoryCalibrationStore;
use weigh_dispatch::Dispatcher;
use weigh_hardware::{CoordinatorConfig, DeviceCoordinator, SerialConnector};
use weigh_network::TcpEventSink;
use weigh_storage::{Database, DatabaseConfig, SqliteEventStore};

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(
    name = "weigh",
    version,
    about = "Serial session manager for RFID readers and weighing balances",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all configured devices until interrupted
    Run {
        /// Configuration file
        #[arg(short, long, env = "WEIGH_CONFIG", default_value = "weigh.toml")]
        config: PathBuf,

        /// Event database, overriding the configuration file
        #[arg(long, env = "WEIGH_DATABASE")]
        database: Option<String>,
    },

    /// Validate a configuration file and print its devices
    Check {
        /// Configuration file
        #[arg(short, long, env = "WEIGH_CONFIG", default_value = "weigh.toml")]
        config: PathBuf,
    },

    /// List available serial ports
    ListPorts,

    /// Print the last stored calibration of every balance
    Calibrations {
        /// Event database
        #[arg(long, env = "WEIGH_DATABASE", default_value = "weigh.db")]
        database: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run { config, database } => run(&config, database.as_deref()).await,
        Commands::Check { config } => check(&config).await,
        Commands::ListPorts => list_ports(),
        Commands::Calibrations { database } => calibrations(&database).await,
    }
}

async fn run(path: &Path, database: Option<&str>) -> anyhow::Result<()> {
    let config = AppConfig::load(path)?;
    let devices = config.device_configs();
    info!(
        version = weigh_core::VERSION,
        config = %path.display(),
        devices = devices.len(),
        "Starting weigh"
    );

    let db = Database::new(config.database.to_database_config(database))
        .await
        .context("opening event database")?;
    let store = SqliteEventStore::new(&db);

    let recovered = store
        .latest_calibrations()
        .await
        .context("loading stored calibrations")?;
    for (device, calibration) in &recovered {
        info!(
            device = %device,
            zero_offset = calibration.zero_offset,
            gain = ?calibration.gain,
            "Recovered calibration"
        );
    }
    let calibrations = Arc::new(MemoryCalibrationStore::with_entries(recovered));

    let (mut coordinator, events) = DeviceCoordinator::new(
        SerialConnector,
        calibrations,
        config.coordinator.to_coordinator_config(),
    );
    let network = config
        .network
        .as_ref()
        .map(|section| TcpEventSink::new(section.to_sink_config()));
    if network.is_none() {
        info!("No [network] section; events are stored only");
    }
    let dispatcher = Dispatcher::spawn(
        events.into_inner(),
        store,
        network,
        config.dispatch.to_dispatcher_config(),
    );

    let report = coordinator
        .configure(devices)
        .await
        .context("applying device configuration")?;
    info!(devices = ?report.added, "Devices configured");
    coordinator.start_all();

    supervise(
        &mut coordinator,
        &dispatcher,
        path,
        config.coordinator.status_interval_secs,
    )
    .await;

    info!("Shutting down");
    coordinator.stop_all().await;
    drop(coordinator);
    let stats = dispatcher.shutdown().await;
    info!(
        stored = stats.storage.delivered,
        store_failures = stats.storage.failed,
        not_stored = stats.storage.dropped,
        forwarded = stats.network.delivered,
        forward_failures = stats.network.failed,
        dropped = stats.network.dropped,
        "Events dispatched"
    );
    db.close().await;
    Ok(())
}

/// Wait for Ctrl-C, logging status periodically and reloading on SIGHUP.
async fn supervise(
    coordinator: &mut DeviceCoordinator,
    dispatcher: &Dispatcher,
    path: &Path,
    status_interval_secs: u64,
) {
    let mut status = tokio::time::interval(Duration::from_secs(status_interval_secs.max(1)));
    status.tick().await;
    let mut hangup = ReloadSignal::new();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = status.tick(), if status_interval_secs > 0 => {
                log_status(coordinator, dispatcher);
            }
            _ = hangup.recv() => {
                reload(coordinator, path).await;
            }
        }
    }
}

fn log_status(coordinator: &DeviceCoordinator, dispatcher: &Dispatcher) {
    for (device, status) in coordinator.statuses() {
        info!(
            device = %device,
            state = ?status.state,
            protocol = ?status.protocol,
            failures = status.consecutive_failures,
            last_error = status.last_error.as_deref().unwrap_or(""),
            "Device status"
        );
    }
    let stats = dispatcher.stats();
    info!(
        stored = stats.storage.delivered,
        store_failures = stats.storage.failed,
        overloaded = stats.storage.overloaded,
        forwarded = stats.network.delivered,
        forward_failures = stats.network.failed,
        dropped = stats.network.dropped,
        "Dispatch status"
    );
}

async fn reload(coordinator: &mut DeviceCoordinator, path: &Path) {
    let config = match AppConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Could not reload configuration: {:#}", e);
            return;
        }
    };
    match coordinator.configure(config.device_configs()).await {
        Ok(report) => info!(
            added = ?report.added,
            removed = ?report.removed,
            changed = ?report.changed,
            "Reloaded device configuration"
        ),
        Err(e) => warn!("Rejected reloaded configuration: {}", e),
    }
}

#[cfg(unix)]
struct ReloadSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Self {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::hangup()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                warn!("Configuration reload on SIGHUP unavailable: {}", e);
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = self.0.as_mut()
            && signal.recv().await.is_some()
        {
            return;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

async fn check(path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load(path)?;
    let devices = config.device_configs();

    // Never started, so no port is opened.
    let (mut coordinator, _events) = DeviceCoordinator::new(
        SerialConnector,
        Arc::new(MemoryCalibrationStore::new()),
        CoordinatorConfig::default(),
    );
    coordinator
        .configure(devices)
        .await
        .with_context(|| format!("{} is invalid", path.display()))?;

    for device in coordinator.devices() {
        println!("{:<16} {:<8} {}", device.name, device.kind, device.serial);
    }
    match &config.network {
        Some(network) => println!("events forwarded to {}", network.address),
        None => println!("events stored only"),
    }
    Ok(())
}

fn list_ports() -> anyhow::Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let description = match port.port_type {
            SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{:<24} {}", port.port_name, description);
    }
    Ok(())
}

async fn calibrations(database: &str) -> anyhow::Result<()> {
    let db = Database::new(DatabaseConfig::new(database).create_if_missing(false))
        .await
        .with_context(|| format!("opening {}", database))?;
    let latest = SqliteEventStore::new(&db).latest_calibrations().await?;
    if latest.is_empty() {
        println!("No calibrations stored");
    }
    for (device, calibration) in latest {
        match calibration.gain {
            Some(gain) => println!("{:<16} zero {:>10}  gain {}", device, calibration.zero_offset, gain),
            None => println!("{:<16} zero {:>10}  uncalibrated", device, calibration.zero_offset),
        }
    }
    db.close().await;
    Ok(())
}
