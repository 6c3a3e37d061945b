//! Wire frames for the Eddy relay protocol.
//!
//! Every frame is one newline-terminated UTF-8 line. The first line on a
//! connection registers a peer id; after that each line is either a client
//! frame (`<target>||<json payload>`) or a relay gossip frame
//! (`RELAY||<json entry>`). Replies are single lines too: plain-text notices,
//! a JSON ack, or a JSON delivery of someone else's message.

use eddy_core::constants::{FRAME_SEPARATOR, RATE_LIMIT_NOTICE, RELAY_PREFIX};
use eddy_core::error::ProtocolError;
use eddy_core::types::{MessageEntry, MsgId, Target};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An entry flooded by a sibling relay.
    Gossip(MessageEntry),
    /// A message submitted by a locally connected peer.
    Client { target: Target, text: String },
}

/// Payload object of a client frame. Fields other than `text` are ignored.
#[derive(Deserialize)]
struct ClientPayload {
    text: String,
}

impl Frame {
    /// Decode a raw line, rejecting invalid UTF-8.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::parse(line)
    }

    /// Parse a line into a gossip or client frame.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if let Some(entry) = line.strip_prefix(RELAY_PREFIX) {
            return Ok(Frame::Gossip(MessageEntry::from_json(entry)?));
        }
        let (target, payload) = line
            .split_once(FRAME_SEPARATOR)
            .ok_or(ProtocolError::MissingSeparator)?;
        let target = Target::parse(target)?;
        let payload: ClientPayload = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Ok(Frame::Client {
            target,
            text: payload.text,
        })
    }

    /// Line a relay sends to a sibling to flood `entry`.
    pub fn gossip_line(entry: &MessageEntry) -> String {
        format!("{RELAY_PREFIX}{}", entry.to_json())
    }

    /// Line a peer sends to address `text` to `target`.
    pub fn client_line(target: &Target, text: &str) -> String {
        format!(
            "{target}{FRAME_SEPARATOR}{}",
            serde_json::json!({ "text": text })
        )
    }
}

/// A message as delivered to a local peer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: i64,
    pub msg_id: MsgId,
}

impl From<&MessageEntry> for Delivery {
    fn from(entry: &MessageEntry) -> Self {
        Self {
            from: entry.from.clone(),
            to: entry.to.clone(),
            text: entry.body.clone(),
            timestamp: entry.timestamp,
            msg_id: entry.id(),
        }
    }
}

/// A line the relay writes back to a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    /// The frame was admitted (or was already known) under this id.
    Ack(MsgId),
    /// The source address is over its rate limit.
    RateLimited,
    /// The named direct target is not connected to this relay.
    TargetNotFound(String),
    /// The frame could not be parsed.
    Malformed(String),
    /// Someone else's message addressed to this peer.
    Delivery(Delivery),
}

impl ServerReply {
    /// Render as a single line, without the trailing newline.
    pub fn render(&self) -> String {
        match self {
            ServerReply::Ack(id) => {
                serde_json::json!({ "status": "ok", "msg_id": id.to_string() }).to_string()
            }
            ServerReply::RateLimited => RATE_LIMIT_NOTICE.to_string(),
            ServerReply::TargetNotFound(target) => format!("[!] Target '{target}' not found."),
            ServerReply::Malformed(detail) => format!("[!] Malformed message: {detail}"),
            ServerReply::Delivery(delivery) => serde_json::to_string(delivery).unwrap_or_default(),
        }
    }
}

impl From<&ProtocolError> for ServerReply {
    fn from(err: &ProtocolError) -> Self {
        ServerReply::Malformed(err.to_string())
    }
}

/// Read one newline-terminated frame of at most `max` bytes.
///
/// Returns `Ok(None)` on a clean end of stream. A trailing `\r` is stripped.
/// A line longer than `max` is an `InvalidData` error: the stream can no
/// longer be resynchronised.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // Room for `max` bytes plus "\r\n".
    let limit = max.saturating_add(2) as u64;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let terminated = buf.last() == Some(&b'\n');
    if terminated {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge {
                size: buf.len(),
                max,
            },
        ));
    }
    Ok(Some(buf))
}
