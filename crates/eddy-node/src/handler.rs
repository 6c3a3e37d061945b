//! Per-connection protocol state machine.
//!
//! ```text
//! AwaitRegistration ──peer id──▶ Active(peer) ──eof / io error / superseded──▶ Closed
//!         │
//!         └──RELAY|| frame──▶ Active(sibling) ─────────────────────────────────▶ Closed
//! ```
//!
//! The first line on a connection is either a raw peer id, which registers a
//! session in the [`ConnectionRegistry`](eddy_network::ConnectionRegistry),
//! or a gossip frame from a sibling relay, which is processed without ever
//! registering. After that, every non-blank line is rate-checked, parsed
//! once into a [`Frame`], and routed. Frames on one connection are handled
//! strictly in arrival order.
//!
//! Cleanup on the way to `Closed` is owned by a drop guard, so the session
//! is released exactly once no matter which step failed.

use std::net::SocketAddr;
use std::sync::Arc;

use eddy_core::constants::RELAY_PREFIX;
use eddy_core::error::{ProtocolError, RelayError};
use eddy_core::types::{MessageEntry, Target, now_millis};
use eddy_network::{ConnectionRegistry, Frame, PeerConnection, ServerReply, read_frame};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

use crate::node::Relay;

/// Who is on the other end of an active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    /// A registered local peer.
    Peer(String),
    /// A sibling relay submitting gossip. Never registered.
    Sibling,
}

/// Releases a registered session when the handler exits.
struct Registration<'a> {
    registry: &'a ConnectionRegistry,
    peer_id: String,
    conn: Arc<PeerConnection>,
}

impl<'a> Registration<'a> {
    fn new(registry: &'a ConnectionRegistry, peer_id: &str, conn: Arc<PeerConnection>) -> Self {
        if let Some(previous) = registry.register(peer_id, Arc::clone(&conn)) {
            info!(peer = %peer_id, old_addr = %previous.addr(), "handler: superseding previous session");
            previous.close();
        }
        Self {
            registry,
            peer_id: peer_id.to_string(),
            conn,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.conn.close();
        if self.registry.release(&self.peer_id, &self.conn) {
            debug!(peer = %self.peer_id, "handler: session unregistered");
        }
    }
}

/// Serve one inbound connection until it closes.
///
/// Never returns an error: every failure is confined to this connection and
/// logged here.
pub async fn handle_connection<S>(relay: Arc<Relay>, stream: S, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!(%addr, "handler: new connection");
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    match run(&relay, &mut reader, write_half, addr).await {
        Ok(Some(session)) => info!(%addr, ?session, "handler: disconnected"),
        Ok(None) => info!(%addr, "handler: closed before registration"),
        Err(e) => warn!(%addr, error = %e, "handler: connection terminated"),
    }
}

/// The state machine proper. Returns the session that was active, if any.
async fn run<R, W>(
    relay: &Relay,
    reader: &mut R,
    writer: W,
    addr: SocketAddr,
) -> Result<Option<Session>, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let network = &relay.config().network;

    // AwaitRegistration: the first line is a peer id or a sibling's gossip.
    let first = match read_frame(reader, network.max_frame_size).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(None),
        Err(e) => return Err(RelayError::ConnectionTerminated(e.to_string())),
    };
    let Ok(first) = String::from_utf8(first) else {
        debug!(%addr, "handler: unreadable registration");
        return Ok(None);
    };

    let (session, conn, _registration, pending) = if first.starts_with(RELAY_PREFIX) {
        let conn = PeerConnection::new(format!("relay@{addr}"), addr, writer);
        info!(%addr, "handler: sibling relay session");
        (Session::Sibling, conn, None, Some(first.into_bytes()))
    } else {
        let peer_id = first.trim();
        if peer_id.is_empty() || peer_id.len() > network.max_peer_id_size {
            debug!(%addr, len = peer_id.len(), "handler: rejected registration");
            return Ok(None);
        }
        let conn = PeerConnection::new(peer_id, addr, writer);
        let registration = Registration::new(relay.registry(), peer_id, Arc::clone(&conn));
        info!(peer = %peer_id, %addr, "handler: registered peer");
        (Session::Peer(peer_id.to_string()), conn, Some(registration), None)
    };

    let active = ActiveSession {
        relay,
        session: &session,
        conn: &conn,
    };

    if let Some(raw) = pending {
        active.process(raw).await?;
    }

    // Active: receive loop until eof, socket error, supersession, or a failed
    // delivery to this peer.
    loop {
        let raw = tokio::select! {
            frame = read_frame(reader, network.max_frame_size) => frame,
            _ = conn.closed() => {
                info!(peer = %conn.peer_id(), "handler: session closed by relay");
                break;
            }
        };
        match raw {
            Ok(Some(raw)) => active.process(raw).await?,
            Ok(None) => break,
            Err(e) => return Err(RelayError::ConnectionTerminated(e.to_string())),
        }
    }
    Ok(Some(session))
}

struct ActiveSession<'a> {
    relay: &'a Relay,
    session: &'a Session,
    conn: &'a Arc<PeerConnection>,
}

impl ActiveSession<'_> {
    /// Rate-check, parse, and route one frame.
    ///
    /// Only a failure to write to this connection's own socket is returned;
    /// everything else is answered or logged.
    async fn process(&self, raw: Vec<u8>) -> Result<(), RelayError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        if !self.relay.limiter().admit(self.conn.addr().ip()) {
            debug!(peer = %self.conn.peer_id(), "handler: frame rate limited");
            return self.reply(ServerReply::RateLimited).await;
        }
        match Frame::decode(&raw) {
            Ok(Frame::Gossip(entry)) => {
                self.on_gossip(entry).await;
                Ok(())
            }
            Ok(Frame::Client { target, text }) => match self.session {
                Session::Peer(peer_id) => self.on_client(peer_id, target, text).await,
                Session::Sibling => self.reply_malformed(&ProtocolError::Unregistered).await,
            },
            Err(e) => self.reply_malformed(&e).await,
        }
    }

    /// Admit a sibling's entry and keep flooding it, unless already known.
    async fn on_gossip(&self, mut entry: MessageEntry) {
        let id = entry.id();
        if self.relay.store().contains(&id) {
            debug!(msg_id = %id, "handler: gossip already known, discarded");
            return;
        }
        entry.msg_id = Some(id);
        if !entry.seen_by_relay(self.relay.relay_id()) {
            entry.mark_seen(self.relay.relay_id());
        }
        if self.relay.store().admit(entry.clone()).is_none() {
            // Lost a race with another copy of the same entry.
            return;
        }
        debug!(msg_id = %id, seen_by = ?entry.seen_by, "handler: gossip admitted");
        match self.relay.forwarder().deliver_local(&entry).await {
            Ok(_) | Err(RelayError::TargetNotFound(_)) => {}
            Err(e) => warn!(msg_id = %id, error = %e, "handler: local delivery of gossip failed"),
        }
        self.forward(entry);
    }

    /// Build, admit, and route a locally submitted message, then ack it.
    async fn on_client(&self, peer_id: &str, target: Target, text: String) -> Result<(), RelayError> {
        let mut entry = MessageEntry::new(peer_id, &target, text, now_millis(), self.relay.relay_id());
        let id = entry.compute_id();

        if self.relay.store().admit(entry.clone()).is_none() {
            debug!(msg_id = %id, "handler: duplicate client frame");
            return self.reply(ServerReply::Ack(id)).await;
        }
        entry.msg_id = Some(id);
        debug!(peer = %peer_id, %target, msg_id = %id, "handler: message admitted");

        match self.relay.forwarder().deliver_local(&entry).await {
            Ok(delivered) => debug!(msg_id = %id, delivered, "handler: delivered locally"),
            Err(RelayError::TargetNotFound(missing)) => {
                self.reply(ServerReply::TargetNotFound(missing)).await?;
            }
            Err(e) => warn!(msg_id = %id, error = %e, "handler: local delivery failed"),
        }
        self.forward(entry);
        self.reply(ServerReply::Ack(id)).await
    }

    /// Flood to siblings in the background so a slow relay never delays
    /// this connection's next frame.
    fn forward(&self, entry: MessageEntry) {
        let forwarder = Arc::clone(self.relay.forwarder());
        tokio::spawn(async move {
            forwarder.forward_to_relays(&entry).await;
        });
    }

    async fn reply_malformed(&self, err: &ProtocolError) -> Result<(), RelayError> {
        debug!(peer = %self.conn.peer_id(), error = %err, "handler: malformed frame");
        self.reply(ServerReply::from(err)).await
    }

    /// Write to this connection. Failure here ends the connection.
    async fn reply(&self, reply: ServerReply) -> Result<(), RelayError> {
        let timeout = self.relay.config().network.send_timeout;
        self.conn
            .send(&reply, timeout)
            .await
            .map_err(|e| RelayError::ConnectionTerminated(e.to_string()))
    }
}
