//! Tenant MQTT gateway CLI

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tenant_mqtt_gateway::auth::{DirectoryData, FileDirectory};
use tenant_mqtt_gateway::{GatewayConfig, MqttProxy, MqttTransport};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Multi-tenant MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "tenant-mqtt-gateway")]
#[command(version)]
#[command(about = "Multi-tenant MQTT gateway bridging local clients to an upstream broker", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };

    info!(path = %path.display(), "Loading configuration from file");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting tenant MQTT gateway"
    );

    let config = load_config(args.config.as_ref())?;

    let directory = match &config.directory.path {
        Some(path) => FileDirectory::from_file(path)?,
        None => {
            warn!("No directory configured, every client will be refused");
            FileDirectory::from_data(DirectoryData::default())
        }
    };
    info!(tenants = directory.tenant_count(), "Directory loaded");

    if config.upstream.max_packet_size < config.listener.max_packet_size {
        warn!(
            upstream = config.upstream.max_packet_size,
            downstream = config.listener.max_packet_size,
            "Upstream packet limit is below the downstream limit, large publishes will be refused"
        );
    }

    let transport = Arc::new(
        MqttTransport::new(&config.upstream).with_packet_events(config.general.log_packets),
    );
    info!(
        host = %config.upstream.host,
        port = config.upstream.port,
        client_id = %transport.client_id(),
        "Upstream transport configured"
    );

    let proxy = MqttProxy::new(&config, transport, Arc::new(directory));
    proxy.init().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    proxy.destroy().await?;
    Ok(())
}
