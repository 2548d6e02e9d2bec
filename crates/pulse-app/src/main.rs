//! Pulse - Entry Point
//!
//! Keeps mover lists and the watchlist in sync with the movers backend over
//! a push channel, falling back to REST polling.

use anyhow::Result;
use clap::Parser;
use pulse_app::{AppConfig, Application, DeviceProfile};
use tracing::info;

/// Live market-data sync for the movers dashboard
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via PULSE_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Device profile (desktop or mobile), overriding the config file
    #[arg(short, long)]
    device: Option<DeviceProfile>,

    /// Skip the push channel and poll from the start
    #[arg(long)]
    no_push: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any wss:// connections)
    pulse_transport::init_crypto();

    let args = Args::parse();

    pulse_telemetry::init_logging()?;

    info!("Starting pulse v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > PULSE_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("PULSE_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let mut config = AppConfig::load(&config_path)?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if args.no_push {
        config.push_enabled = false;
    }
    info!(
        base_url = %config.base_url,
        device = %config.device,
        push_enabled = config.push_enabled,
        "Configuration loaded"
    );

    let app = Application::new(config)?;
    app.run().await?;

    Ok(())
}
