//! Static directory of sibling relays.
//!
//! Loaded once at startup from operator-supplied records of the form
//! `{"id": "...", "ip": "...", "port": 55665}`. The local relay's own record
//! is dropped so a shared mesh file can be deployed unchanged on every relay.

use eddy_core::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// One record of the relay directory file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelayRecord {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

/// A sibling relay this node floods gossip to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPeer {
    pub relay_id: String,
    pub host: String,
    pub port: u16,
}

impl RelayPeer {
    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The active sibling table, excluding the local relay.
#[derive(Clone, Debug, Default)]
pub struct RelayDirectory {
    peers: Vec<RelayPeer>,
}

impl RelayDirectory {
    /// Build the table from `records`, skipping `local_id` and duplicate ids.
    pub fn from_records(records: Vec<RelayRecord>, local_id: &str) -> Self {
        let mut seen = HashSet::new();
        let mut peers = Vec::with_capacity(records.len());
        for record in records {
            if record.id == local_id {
                continue;
            }
            if !seen.insert(record.id.clone()) {
                warn!(relay = %record.id, "directory: duplicate relay id ignored");
                continue;
            }
            peers.push(RelayPeer {
                relay_id: record.id,
                host: record.ip,
                port: record.port,
            });
        }
        info!(local = %local_id, siblings = peers.len(), "directory: relay table built");
        Self { peers }
    }

    /// Parse a JSON array of records.
    pub fn parse_records(raw: &str) -> Result<Vec<RelayRecord>, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::Directory(e.to_string()))
    }

    /// Read and parse a directory file.
    pub fn load_records(path: &Path) -> Result<Vec<RelayRecord>, RelayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Directory(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::parse_records(&raw)
    }

    pub fn peers(&self) -> &[RelayPeer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MESH: &str = r#"[
        {"id": "relay-a", "ip": "10.0.0.1", "port": 55665},
        {"id": "relay-b", "ip": "10.0.0.2", "port": 55666},
        {"id": "relay-c", "ip": "relay-c.internal", "port": 55667}
    ]"#;

    #[test]
    fn local_relay_is_excluded() {
        let records = RelayDirectory::parse_records(MESH).unwrap();
        let dir = RelayDirectory::from_records(records, "relay-b");
        let ids: Vec<_> = dir.peers().iter().map(|p| p.relay_id.as_str()).collect();
        assert_eq!(ids, vec!["relay-a", "relay-c"]);
        assert_eq!(dir.peers()[1].socket_addr(), "relay-c.internal:55667");
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let records = vec![
            RelayRecord { id: "x".into(), ip: "1.1.1.1".into(), port: 1 },
            RelayRecord { id: "x".into(), ip: "2.2.2.2".into(), port: 2 },
        ];
        let dir = RelayDirectory::from_records(records, "local");
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.peers()[0].host, "1.1.1.1");
    }

    #[test]
    fn malformed_file_rejected() {
        assert!(matches!(
            RelayDirectory::parse_records(r#"[{"id": "a", "ip": "x"}]"#),
            Err(RelayError::Directory(_))
        ));
        assert!(RelayDirectory::parse_records("not json").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MESH.as_bytes()).unwrap();
        let records = RelayDirectory::load_records(file.path()).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RelayDirectory::load_records(Path::new("/nonexistent/mesh.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/mesh.json"));
    }

    #[test]
    fn empty_directory() {
        let dir = RelayDirectory::default();
        assert!(dir.is_empty());
    }
}
