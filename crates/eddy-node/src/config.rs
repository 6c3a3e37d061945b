//! Relay configuration.
//!
//! Provides [`RelayConfig`] with defaults for the relay id, rate limiting,
//! disk logging, and network settings. The binary fills it from CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use eddy_core::constants::{DEFAULT_RATE_INTERVAL, DEFAULT_RATE_LIMIT, MESSAGE_LOG_FILE};
use eddy_network::{NetworkConfig, RelayRecord};

/// Configuration for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// This relay's identifier in the mesh.
    pub relay_id: String,
    /// Listener and outbound socket settings.
    pub network: NetworkConfig,
    /// Sibling relay records; the entry matching `relay_id` is ignored.
    pub relay_peers: Vec<RelayRecord>,
    /// Frames admitted per source address within `rate_interval`.
    pub rate_limit: usize,
    /// Sliding window for rate limiting.
    pub rate_interval: Duration,
    /// Append admitted entries to the message log on disk.
    pub log_to_disk: bool,
    /// Root directory for the message log.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "eddy_node_lib=debug").
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eddy");

        Self {
            relay_id: "relay-1".to_string(),
            network: NetworkConfig::default(),
            relay_peers: Vec::new(),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_interval: DEFAULT_RATE_INTERVAL,
            log_to_disk: true,
            data_dir,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// In-memory relay on a loopback ephemeral port.
    pub fn local(relay_id: impl Into<String>) -> Self {
        Self {
            relay_id: relay_id.into(),
            network: NetworkConfig::local(),
            log_to_disk: false,
            ..Self::default()
        }
    }

    /// Path to the append-only message log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(MESSAGE_LOG_FILE)
    }
}
