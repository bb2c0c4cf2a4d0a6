//! LO device client - Main Entry Point
//!
//! Loads the configuration, starts `device.count` simulated devices one second
//! apart, and stops them all on SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use lo_device_client::config::DeviceConfig;
use lo_device_client::device::{DeviceIdAllocator, DeviceRunner};
use lo_device_client::observability::init_default_logging;
use lo_device_client::transport::mqtt::ConnectionManager;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Delay between two device starts
const DEVICE_START_STAGGER: Duration = Duration::from_secs(1);

/// Rate-regulated MQTT device client
#[derive(Parser)]
#[command(name = "lo-device")]
#[command(about = "Publish telemetry and answer commands as one or more MQTT devices")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LO_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the devices and run until done or interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting LO device client v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_devices(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in ["device.toml", "config/device.toml"] {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

async fn run_devices(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = ConnectionManager::from_config(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(forward_shutdown(wait_for_signal(), shutdown_tx));

    let allocator = DeviceIdAllocator::new();
    let mut devices = JoinSet::new();

    for n in 0..config.device.count {
        if n > 0 {
            let mut shutdown = shutdown_rx.clone();
            tokio::select! {
                _ = sleep(DEVICE_START_STAGGER) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        let index = allocator.allocate();
        let runner = DeviceRunner::new(config.clone(), manager.clone(), index);
        let shutdown = shutdown_rx.clone();
        devices.spawn(async move { (index, runner.run(shutdown).await) });
    }

    let mut fatal = 0usize;
    while let Some(joined) = devices.join_next().await {
        match joined {
            Ok((index, Ok(report))) => info!(
                device = index,
                attempts = report.loop_report.attempts,
                failures = report.loop_report.failures,
                exit = ?report.loop_report.exit,
                "Device finished"
            ),
            Ok((index, Err(e))) => {
                fatal += 1;
                error!(device = index, fatal = e.is_fatal(), error = %e.sanitized(), "Device failed to start");
            }
            Err(e) => {
                fatal += 1;
                warn!("Device task ended abnormally: {}", e);
            }
        }
    }

    if fatal > 0 {
        return Err(format!("{fatal} device(s) failed").into());
    }
    Ok(())
}

/// Flip the shutdown flag once `signal` fires
///
/// If the handlers cannot be installed the devices keep running and the
/// sender stays alive, so receivers never see a spurious shutdown.
async fn forward_shutdown<F>(signal: F, shutdown_tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received, stopping devices...");
            let _ = shutdown_tx.send(true);
        }
        Err(e) => {
            error!("Signal handling failed, devices cannot be interrupted: {}", e);
            let _shutdown_tx = shutdown_tx;
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

fn handle_config_command(config: &DeviceConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(
        devices = config.device.count,
        secured = config.is_secured()?,
        "Configuration validation complete"
    );
    Ok(())
}
