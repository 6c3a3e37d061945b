//! Live registry of locally connected peers.
//!
//! Each registered peer id maps to the [`PeerConnection`] currently serving
//! it. The map sits behind a [`parking_lot::Mutex`] that is never held across
//! an `.await`: fan-out callers take a snapshot with [`ConnectionRegistry::all`]
//! and send outside the lock.

use eddy_core::error::RelayError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

use crate::protocol::ServerReply;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write side of one peer's socket plus a close signal for its reader.
pub struct PeerConnection {
    peer_id: String,
    addr: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    pub fn new<W>(peer_id: impl Into<String>, addr: SocketAddr, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            peer_id: peer_id.into(),
            addr,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Write `reply` as one line, bounded by `timeout`.
    pub async fn send(&self, reply: &ServerReply, timeout: Duration) -> Result<(), RelayError> {
        self.send_line(&reply.render(), timeout).await
    }

    /// Write `line` followed by a newline, bounded by `timeout`.
    ///
    /// A failed or timed-out write may leave part of the line on the socket,
    /// so any failure closes the connection: later sends fail immediately
    /// and the owning handler ends the session.
    pub async fn send_line(&self, line: &str, timeout: Duration) -> Result<(), RelayError> {
        let delivery_error = |reason: String| RelayError::Delivery {
            peer: self.peer_id.clone(),
            reason,
        };
        if self.is_closed() {
            return Err(delivery_error("connection closed".into()));
        }
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => delivery_error(e.to_string()),
            Err(_) => delivery_error(format!("send timed out after {timeout:?}")),
        };
        self.close();
        Err(result)
    }

    /// Signal the reading task to stop. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.peer_id, addr = %self.addr, "registry: connection close requested");
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let notified = self.close_signal.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Mapping from peer id to the connection currently serving it.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<String, Arc<PeerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `peer_id`, returning the session it replaced.
    ///
    /// Last writer wins. The caller decides what to do with the superseded
    /// connection; this method never performs I/O.
    pub fn register(&self, peer_id: &str, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let previous = self.sessions.lock().insert(peer_id.to_string(), conn);
        debug!(peer = %peer_id, replaced = previous.is_some(), "registry: peer registered");
        previous
    }

    /// Remove whatever session is registered under `peer_id`. Idempotent.
    pub fn unregister(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        let removed = self.sessions.lock().remove(peer_id);
        if removed.is_some() {
            debug!(peer = %peer_id, "registry: peer unregistered");
        }
        removed
    }

    /// Remove `peer_id` only if it still maps to `conn`.
    ///
    /// A handler whose session was superseded must not evict its replacement.
    pub fn release(&self, peer_id: &str, conn: &Arc<PeerConnection>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(peer_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                sessions.remove(peer_id);
                debug!(peer = %peer_id, "registry: session released");
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.sessions.lock().get(peer_id).cloned()
    }

    /// Snapshot of every registered session.
    pub fn all(&self) -> Vec<(String, Arc<PeerConnection>)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn conn(peer: &str) -> (Arc<PeerConnection>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (PeerConnection::new(peer, addr(), ours), theirs)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let reg = ConnectionRegistry::new();
        let (alice, _rx) = conn("alice");
        assert!(reg.register("alice", alice.clone()).is_none());
        let found = reg.lookup("alice").unwrap();
        assert!(Arc::ptr_eq(&found, &alice));
        assert!(reg.lookup("bob").is_none());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn reregistration_replaces_and_returns_previous() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = conn("alice");
        let (second, _rx2) = conn("alice");
        reg.register("alice", first.clone());
        let previous = reg.register("alice", second.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&reg.lookup("alice").unwrap(), &second));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let (alice, _rx) = conn("alice");
        reg.register("alice", alice);
        assert!(reg.unregister("alice").is_some());
        assert!(reg.unregister("alice").is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn release_only_removes_own_session() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = conn("alice");
        let (second, _rx2) = conn("alice");
        reg.register("alice", first.clone());
        reg.register("alice", second.clone());

        assert!(!reg.release("alice", &first), "stale session must not evict replacement");
        assert!(reg.lookup("alice").is_some());
        assert!(reg.release("alice", &second));
        assert!(reg.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn snapshot_survives_concurrent_mutation() {
        let reg = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for name in ["a", "b", "c"] {
            let (c, rx) = conn(name);
            reg.register(name, c);
            keep.push(rx);
        }
        let snapshot = reg.all();
        for (id, _) in &snapshot {
            reg.unregister(id);
        }
        assert_eq!(snapshot.len(), 3);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn send_writes_one_line() {
        let (alice, rx) = conn("alice");
        alice
            .send(&ServerReply::RateLimited, Duration::from_secs(1))
            .await
            .unwrap();
        let mut lines = BufReader::new(rx).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "[!] Rate limit exceeded.");
    }

    #[tokio::test]
    async fn send_to_dropped_peer_fails() {
        let (alice, rx) = conn("alice");
        drop(rx);
        let err = alice
            .send_line("hello", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery { ref peer, .. } if peer == "alice"));
    }

    #[tokio::test]
    async fn send_times_out_when_peer_stops_reading() {
        let (ours, _theirs) = tokio::io::duplex(8);
        let slow = PeerConnection::new("slow", addr(), ours);
        let err = slow
            .send_line("this line is longer than the pipe", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn timed_out_send_closes_connection_without_splicing_lines() {
        let (ours, mut theirs) = tokio::io::duplex(16);
        let slow = PeerConnection::new("slow", addr(), ours);
        let long = format!("{{\"text\":\"{}\"}}", "a".repeat(40));
        assert!(slow.send_line(&long, Duration::from_millis(50)).await.is_err());
        assert!(slow.is_closed());

        let err = slow
            .send_line(r#"{"text":"second"}"#, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection closed"));

        drop(slow);
        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        let received = String::from_utf8(received).unwrap();
        assert!(!received.contains("second"), "fragment was extended: {received:?}");
    }

    #[tokio::test]
    async fn write_error_closes_connection() {
        let (alice, rx) = conn("alice");
        drop(rx);
        assert!(alice.send_line("hello", Duration::from_secs(1)).await.is_err());
        assert!(alice.is_closed());
        // The owning handler's wait on `closed()` resolves.
        tokio::time::timeout(Duration::from_secs(1), alice.closed())
            .await
            .expect("closed() should resolve after a failed send");
    }

    #[tokio::test]
    async fn close_wakes_waiter_and_blocks_sends() {
        let (alice, _rx) = conn("alice");
        let waiter = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.closed().await })
        };
        tokio::task::yield_now().await;
        alice.close();
        alice.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(alice.is_closed());
        assert!(alice.send_line("x", Duration::from_secs(1)).await.is_err());
        // Waiting after close resolves immediately.
        alice.closed().await;
    }
}
