//! Network configuration for an Eddy relay.

use eddy_core::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RELAY_PORT, DEFAULT_SEND_TIMEOUT, MAX_FRAME_SIZE,
    MAX_PEER_ID_SIZE,
};
use std::time::Duration;

/// Socket-level settings for the relay listener and its outbound calls.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on. `0` picks an ephemeral port.
    pub listen_port: u16,
    /// Timeout for connecting to a sibling relay.
    pub connect_timeout: Duration,
    /// Timeout for a single send to a local peer or sibling relay.
    pub send_timeout: Duration,
    /// Largest accepted frame, newline excluded.
    pub max_frame_size: usize,
    /// Largest accepted registration line.
    pub max_peer_id_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_RELAY_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            max_peer_id_size: MAX_PEER_ID_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Loopback listener on an ephemeral port, for tests and local meshes.
    pub fn local() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            ..Self::default()
        }
    }

    /// `addr:port` string for binding the listener.
    pub fn listen_socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}
