//! Flood forwarding of admitted entries to local peers and sibling relays.
//!
//! Local delivery writes to registered [`PeerConnection`]s; sibling delivery
//! opens a short-lived TCP connection per relay, writes one gossip line, and
//! closes. Both fan-outs run their sends concurrently, each bounded by the
//! configured timeouts, so one slow or dead endpoint never stalls the rest.
//! Failures are logged and skipped: no retry, no queueing, and no registry
//! pruning (that belongs to the failing peer's own handler).

use eddy_core::error::RelayError;
use eddy_core::types::{MessageEntry, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::directory::{RelayDirectory, RelayPeer};
use crate::protocol::{Delivery, Frame, ServerReply};
use crate::registry::{ConnectionRegistry, PeerConnection};

pub struct FloodForwarder {
    local_id: String,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RelayDirectory>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl FloodForwarder {
    pub fn new(
        local_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<RelayDirectory>,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            registry,
            directory,
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
        }
    }

    /// Deliver `entry` to the local peers it is addressed to.
    ///
    /// Broadcasts go to every registered peer except the sender; direct
    /// messages go to exactly the named peer. Returns how many sends
    /// succeeded, or [`RelayError::TargetNotFound`] when a direct target is
    /// not registered here.
    pub async fn deliver_local(&self, entry: &MessageEntry) -> Result<usize, RelayError> {
        let recipients: Vec<Arc<PeerConnection>> = match entry.target()? {
            Target::All => self
                .registry
                .all()
                .into_iter()
                .filter(|(peer_id, _)| *peer_id != entry.from)
                .map(|(_, conn)| conn)
                .collect(),
            Target::Peer(peer_id) => match self.registry.lookup(&peer_id) {
                Some(conn) => vec![conn],
                None => return Err(RelayError::TargetNotFound(peer_id)),
            },
        };

        let line = ServerReply::Delivery(Delivery::from(entry)).render();
        let mut sends = JoinSet::new();
        for conn in recipients {
            let line = line.clone();
            let timeout = self.send_timeout;
            sends.spawn(async move {
                match conn.send_line(&line, timeout).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(peer = %conn.peer_id(), error = %e, "forwarder: local delivery failed");
                        false
                    }
                }
            });
        }
        let delivered = join_successes(sends).await;
        debug!(msg_id = %entry.id(), delivered, "forwarder: local delivery complete");
        Ok(delivered)
    }

    /// Push `entry` to every sibling relay not already in its `seen_by` trail.
    ///
    /// The local relay id is appended to the trail first if it is missing.
    /// Returns how many siblings accepted the gossip line.
    pub async fn forward_to_relays(&self, entry: &MessageEntry) -> usize {
        let mut entry = entry.clone();
        if !entry.seen_by_relay(&self.local_id) {
            entry.mark_seen(&self.local_id);
        }
        let line = Frame::gossip_line(&entry);

        let mut pushes = JoinSet::new();
        for peer in self.directory.peers() {
            if entry.seen_by_relay(&peer.relay_id) {
                debug!(relay = %peer.relay_id, msg_id = %entry.id(), "forwarder: sibling already saw entry");
                continue;
            }
            let peer = peer.clone();
            let line = line.clone();
            let (connect_timeout, send_timeout) = (self.connect_timeout, self.send_timeout);
            pushes.spawn(async move {
                match push_gossip(&peer, &line, connect_timeout, send_timeout).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(relay = %peer.relay_id, addr = %peer.socket_addr(), error = %e,
                            "forwarder: relay forwarding failed");
                        false
                    }
                }
            });
        }
        let forwarded = join_successes(pushes).await;
        debug!(msg_id = %entry.id(), forwarded, "forwarder: relay forwarding complete");
        forwarded
    }
}

/// Open a connection to `peer`, write one gossip line, and close.
async fn push_gossip(
    peer: &RelayPeer,
    line: &str,
    connect_timeout: Duration,
    send_timeout: Duration,
) -> Result<(), RelayError> {
    let delivery_error = |reason: String| RelayError::Delivery {
        peer: peer.relay_id.clone(),
        reason,
    };
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(peer.socket_addr()))
        .await
        .map_err(|_| delivery_error(format!("connect timed out after {connect_timeout:?}")))?
        .map_err(|e| delivery_error(e.to_string()))?;

    let write = async {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.shutdown().await
    };
    tokio::time::timeout(send_timeout, write)
        .await
        .map_err(|_| delivery_error(format!("send timed out after {send_timeout:?}")))?
        .map_err(|e| delivery_error(e.to_string()))
}

async fn join_successes(mut set: JoinSet<bool>) -> usize {
    let mut ok = 0;
    while let Some(result) = set.join_next().await {
        if matches!(result, Ok(true)) {
            ok += 1;
        }
    }
    ok
}
