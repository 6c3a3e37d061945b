//! Shared helpers for relay integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eddy_core::types::{MsgId, Target};
use eddy_network::protocol::Delivery;
use eddy_network::{Frame, RelayRecord};
use eddy_node_lib::{Relay, RelayConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// How long a test waits for a line before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a test listens to conclude nothing else is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// In-memory loopback config with a rate limit high enough to stay out of
/// the way of tests that are not about rate limiting.
pub fn relay_config(relay_id: &str) -> RelayConfig {
    RelayConfig {
        rate_limit: 10_000,
        ..RelayConfig::local(relay_id)
    }
}

/// Build and serve a relay on an ephemeral loopback port.
pub async fn start_relay(config: RelayConfig) -> (Arc<Relay>, SocketAddr) {
    let relay = Relay::new(config).unwrap();
    let addr = Arc::clone(&relay).spawn().await.unwrap();
    (relay, addr)
}

/// Start one relay per id, each listing every other as a sibling.
///
/// Listeners are bound before any relay is built so every directory can
/// name real ports.
pub async fn start_mesh(ids: &[&str]) -> Vec<(Arc<Relay>, SocketAddr)> {
    let mut listeners = Vec::new();
    for _ in ids {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let records: Vec<RelayRecord> = ids
        .iter()
        .zip(&listeners)
        .map(|(id, l)| RelayRecord {
            id: id.to_string(),
            ip: "127.0.0.1".into(),
            port: l.local_addr().unwrap().port(),
        })
        .collect();

    let mut relays = Vec::new();
    for (id, listener) in ids.iter().zip(listeners) {
        let relay = Relay::new(RelayConfig {
            relay_peers: records.clone(),
            ..relay_config(id)
        })
        .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&relay).serve(listener));
        relays.push((relay, addr));
    }
    relays
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A line-oriented chat client.
pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Connect and register `peer_id`, waiting until `relay` has the session.
    pub async fn register(relay: &Relay, addr: SocketAddr, peer_id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send_line(peer_id).await;
        wait_until(&format!("registration of {peer_id}"), || {
            relay.registry().lookup(peer_id).is_some()
        })
        .await;
        client
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn send(&mut self, target: &Target, text: &str) {
        self.send_line(&Frame::client_line(target, text)).await;
    }

    /// Send a broadcast or direct message and return the acked id.
    pub async fn send_acked(&mut self, target: &Target, text: &str) -> MsgId {
        self.send(target, text).await;
        self.next_ack().await
    }

    pub async fn next_line(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed while waiting for a line")
    }

    pub async fn next_ack(&mut self) -> MsgId {
        let line = self.next_line().await;
        let v: serde_json::Value =
            serde_json::from_str(&line).unwrap_or_else(|_| panic!("not an ack: {line}"));
        assert_eq!(v["status"], "ok", "not an ack: {line}");
        v["msg_id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn next_delivery(&mut self) -> Delivery {
        let line = self.next_line().await;
        serde_json::from_str(&line).unwrap_or_else(|_| panic!("not a delivery: {line}"))
    }

    /// Assert nothing arrives for [`QUIET_PERIOD`].
    pub async fn expect_silence(&mut self) {
        if let Ok(line) = tokio::time::timeout(QUIET_PERIOD, self.lines.next_line()).await {
            panic!("expected silence, got {line:?}");
        }
    }

    /// Assert the relay closed this connection.
    pub async fn expect_closed(&mut self) {
        let res = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for close");
        match res {
            Ok(None) | Err(_) => {}
            Ok(Some(line)) => panic!("expected close, got line {line:?}"),
        }
    }
}
