//! Eddy relay binary.
//!
//! Accepts chat clients over a line-based TCP protocol, deduplicates every
//! message by content id, and floods it to the sibling relays named in the
//! relay directory file.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use eddy_core::constants::{DEFAULT_RATE_INTERVAL, DEFAULT_RATE_LIMIT, DEFAULT_RELAY_PORT};
use eddy_network::{NetworkConfig, RelayDirectory, RelayRecord};
use eddy_node_lib::{Relay, RelayConfig};
use tracing::{error, info};

/// Eddy relay node.
#[derive(Parser, Debug)]
#[command(
    name = "eddy-node",
    version,
    about = "Federated text-message relay with flood forwarding"
)]
struct Args {
    /// This relay's identifier in the mesh
    #[arg(long, default_value = "relay-1")]
    relay_id: String,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// Listen port
    #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// JSON file listing sibling relays as `[{"id", "ip", "port"}]`
    #[arg(long)]
    relay_directory: Option<PathBuf>,

    /// Frames admitted per source address within the rate interval
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT)]
    rate_limit: usize,

    /// Length of the sliding rate-limit window, in seconds
    #[arg(long, default_value_t = DEFAULT_RATE_INTERVAL.as_secs())]
    rate_interval_secs: u64,

    /// Keep the message log in memory only
    #[arg(long)]
    no_disk_log: bool,

    /// Directory for the message log
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Convert CLI args into a RelayConfig, the log format, and the relay
    /// directory path to load once logging is up.
    fn into_config(self) -> (RelayConfig, String, Option<PathBuf>) {
        let defaults = RelayConfig::default();
        let config = RelayConfig {
            relay_id: self.relay_id,
            network: NetworkConfig {
                listen_addr: self.listen_addr,
                listen_port: self.port,
                ..NetworkConfig::default()
            },
            rate_limit: self.rate_limit,
            rate_interval: Duration::from_secs(self.rate_interval_secs),
            log_to_disk: !self.no_disk_log,
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            log_level: self.log_level,
            ..defaults
        };
        (config, self.log_format, self.relay_directory)
    }
}

/// Read sibling records from the relay directory file, if one was given.
fn load_relay_peers(path: Option<&Path>) -> anyhow::Result<Vec<RelayRecord>> {
    match path {
        Some(path) => RelayDirectory::load_records(path)
            .with_context(|| format!("loading relay directory {}", path.display())),
        None => Ok(Vec::new()),
    }
}

#[tokio::main]
async fn main() {
    let (mut config, log_format, directory) = Args::parse().into_config();
    init_logging(&config.log_level, &log_format);

    config.relay_peers = match load_relay_peers(directory.as_deref()) {
        Ok(peers) => peers,
        Err(e) => {
            error!("invalid configuration: {:#}", e);
            process::exit(1);
        }
    };

    info!("Eddy relay v{}", env!("CARGO_PKG_VERSION"));
    info!("relay_id: {}", config.relay_id);
    info!("listen: {}", config.network.listen_socket_addr());
    if config.log_to_disk {
        info!("message_log: {:?}", config.log_path());
    } else {
        info!("message_log: in memory only");
    }

    let relay = match Relay::new(config) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to start relay: {}", e);
            process::exit(1);
        }
    };
    let listener = match relay.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind listener: {}", e);
            process::exit(1);
        }
    };
    info!(
        "rate_limit: {} per {:?}",
        relay.limiter().limit(),
        relay.limiter().interval()
    );
    info!("relay initialized: {}", relay.stats());
    info!("Eddy relay running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down...");
    };

    tokio::select! {
        _ = relay.clone().serve(listener) => {
            info!("accept loop exited");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    info!("final stats: {}", relay.stats());
    info!("Eddy relay shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
