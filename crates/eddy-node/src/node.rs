//! Relay composition and accept loop.
//!
//! The [`Relay`] struct owns every piece of shared state: the connection
//! registry, rate limiter, dedup store, and flood forwarder. Each structure
//! carries its own lock, so connection tasks contend only on the piece they
//! touch. [`Relay::serve`] spawns one [`handle_connection`] task per inbound
//! socket and never waits on a connection's lifetime.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eddy_core::error::RelayError;
use eddy_network::{ConnectionRegistry, FloodForwarder, RateLimiter, RelayDirectory};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::handler::handle_connection;
use crate::storage::DedupStore;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Point-in-time counters for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub connected_peers: usize,
    pub stored_entries: usize,
    pub siblings: usize,
    pub persistence_failures: u64,
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peers={} stored={} siblings={} persistence_failures={}",
            self.connected_peers, self.stored_entries, self.siblings, self.persistence_failures
        )
    }
}

/// A running relay: shared state plus configuration.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    limiter: RateLimiter,
    store: DedupStore,
    directory: Arc<RelayDirectory>,
    forwarder: Arc<FloodForwarder>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("relay_id", &self.config.relay_id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Relay {
    /// Build a relay from `config`.
    ///
    /// Opens (and replays) the message log when disk logging is enabled and
    /// builds the sibling table from `config.relay_peers`.
    pub fn new(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let store = if config.log_to_disk {
            DedupStore::open(config.log_path())?
        } else {
            DedupStore::in_memory()
        };

        let directory = Arc::new(RelayDirectory::from_records(
            config.relay_peers.clone(),
            &config.relay_id,
        ));
        let registry = Arc::new(ConnectionRegistry::new());
        let forwarder = Arc::new(FloodForwarder::new(
            config.relay_id.clone(),
            Arc::clone(&registry),
            Arc::clone(&directory),
            &config.network,
        ));
        let limiter = RateLimiter::new(config.rate_limit, config.rate_interval);

        Ok(Arc::new(Self {
            config,
            registry,
            limiter,
            store,
            directory,
            forwarder,
        }))
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr = self.config.network.listen_socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(relay = %self.config.relay_id, addr = %listener.local_addr()?, "relay: listening");
        Ok(listener)
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Accept errors are logged and retried; no single connection's failure
    /// reaches this loop. Idle rate-limit windows are swept once per interval.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut sweep = tokio::time::interval(self.config.rate_interval.max(Duration::from_secs(1)));
        sweep.tick().await;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%addr, error = %e, "relay: set_nodelay failed");
                        }
                        tokio::spawn(handle_connection(Arc::clone(&self), stream, addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "relay: accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = sweep.tick() => {
                    let removed = self.limiter.sweep();
                    if removed > 0 {
                        debug!(removed, "relay: swept idle rate windows");
                    }
                }
            }
        }
    }

    /// Bind and serve. Only returns if binding fails.
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Bind, spawn the accept loop, and return the bound address.
    pub async fn spawn(self: Arc<Self>) -> Result<SocketAddr, RelayError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        tokio::spawn(self.serve(listener));
        Ok(addr)
    }

    pub fn relay_id(&self) -> &str {
        &self.config.relay_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn forwarder(&self) -> &Arc<FloodForwarder> {
        &self.forwarder
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connected_peers: self.registry.len(),
            stored_entries: self.store.len(),
            siblings: self.directory.len(),
            persistence_failures: self.store.persistence_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_network::RelayRecord;

    #[test]
    fn new_relay_excludes_itself_from_siblings() {
        let config = RelayConfig {
            relay_peers: vec![
                RelayRecord { id: "a".into(), ip: "127.0.0.1".into(), port: 1 },
                RelayRecord { id: "b".into(), ip: "127.0.0.1".into(), port: 2 },
            ],
            ..RelayConfig::local("a")
        };
        let relay = Relay::new(config).unwrap();
        assert_eq!(relay.stats().siblings, 1);
        assert_eq!(relay.relay_id(), "a");
    }

    #[test]
    fn disk_logging_opens_journal_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            log_to_disk: true,
            data_dir: dir.path().to_path_buf(),
            ..RelayConfig::local("a")
        };
        let relay = Relay::new(config).unwrap();
        assert_eq!(relay.store().path(), Some(dir.path().join("relay_log.jsonl").as_path()));
    }

    #[test]
    fn limiter_uses_configured_window() {
        let config = RelayConfig {
            rate_limit: 4,
            rate_interval: Duration::from_secs(30),
            ..RelayConfig::local("a")
        };
        let relay = Relay::new(config).unwrap();
        assert_eq!(relay.limiter().limit(), 4);
        assert_eq!(relay.limiter().interval(), Duration::from_secs(30));
    }

    #[test]
    fn stats_display() {
        let relay = Relay::new(RelayConfig::local("a")).unwrap();
        assert_eq!(
            relay.stats().to_string(),
            "peers=0 stored=0 siblings=0 persistence_failures=0"
        );
    }

    #[tokio::test]
    async fn spawn_binds_ephemeral_port() {
        let relay = Relay::new(RelayConfig::local("a")).unwrap();
        let addr = relay.spawn().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
    }
}
