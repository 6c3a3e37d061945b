//! Core relay types: message identities, routing targets, message entries.
//!
//! A [`MessageEntry`] is identified by a [`MsgId`], the BLAKE3 digest of its
//! canonical encoding. The relay that first admits an entry fixes its id;
//! later hops append to `seen_by` without re-deriving it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::BROADCAST_TARGET;
use crate::error::ProtocolError;

/// A 32-byte content-derived message identifier, rendered as lowercase hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(pub [u8; 32]);

impl MsgId {
    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for MsgId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ProtocolError::InvalidGossip(format!("bad msg_id '{s}': {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for MsgId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MsgId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a message is addressed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every connected peer except the sender.
    All,
    /// A single named peer.
    Peer(String),
}

impl Target {
    /// Interpret a raw target field. [`BROADCAST_TARGET`] maps to [`Target::All`].
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProtocolError::EmptyTarget);
        }
        if raw == BROADCAST_TARGET {
            Ok(Target::All)
        } else {
            Ok(Target::Peer(raw.to_string()))
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::All)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str(BROADCAST_TARGET),
            Target::Peer(id) => f.write_str(id),
        }
    }
}

/// A chat message as stored, logged, and gossiped between relays.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageEntry {
    /// Sending peer id (or relay id for relay-originated entries).
    pub from: String,
    /// Target peer id, or [`BROADCAST_TARGET`].
    pub to: String,
    /// Text payload.
    pub body: String,
    /// Milliseconds since the Unix epoch, assigned by the first admitting relay.
    pub timestamp: i64,
    /// Relay ids that have forwarded this entry, in order. Append-only.
    #[serde(default)]
    pub seen_by: Vec<String>,
    /// Identity fixed at first admission. Absent on entries not yet admitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
}

impl MessageEntry {
    /// Build a fresh entry created by `origin_relay` at `timestamp`.
    pub fn new(
        from: impl Into<String>,
        to: &Target,
        body: impl Into<String>,
        timestamp: i64,
        origin_relay: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.to_string(),
            body: body.into(),
            timestamp,
            seen_by: vec![origin_relay.into()],
            msg_id: None,
        }
    }

    /// Canonical encoding of every field except `msg_id`.
    ///
    /// Compact JSON with keys in lexicographic order, so the bytes depend
    /// only on field values.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::json!({
            "body": self.body,
            "from": self.from,
            "seen_by": self.seen_by,
            "timestamp": self.timestamp,
            "to": self.to,
        })
        .to_string()
        .into_bytes()
    }

    /// BLAKE3 digest of [`canonical_bytes`](Self::canonical_bytes).
    pub fn compute_id(&self) -> MsgId {
        MsgId(blake3::hash(&self.canonical_bytes()).into())
    }

    /// The carried id if one was assigned, otherwise the computed one.
    pub fn id(&self) -> MsgId {
        self.msg_id.unwrap_or_else(|| self.compute_id())
    }

    /// Parsed routing target.
    pub fn target(&self) -> Result<Target, ProtocolError> {
        Target::parse(&self.to)
    }

    /// Whether `relay_id` already appears in the provenance trail.
    pub fn seen_by_relay(&self, relay_id: &str) -> bool {
        self.seen_by.iter().any(|r| r == relay_id)
    }

    /// Append `relay_id` to `seen_by`. The trail is never reordered or trimmed.
    pub fn mark_seen(&mut self, relay_id: &str) {
        self.seen_by.push(relay_id.to_string());
    }

    /// Full JSON encoding, including `msg_id` when assigned.
    pub fn to_json(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode an entry received from a sibling relay.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidGossip(e.to_string()))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
