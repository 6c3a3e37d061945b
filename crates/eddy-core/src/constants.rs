//! Protocol constants for the Eddy relay mesh.

use std::time::Duration;

/// Default TCP port a relay listens on.
pub const DEFAULT_RELAY_PORT: u16 = 55665;

/// Reserved target value addressing every connected peer.
pub const BROADCAST_TARGET: &str = "ALL";

/// Separator between the target and the payload of a client frame.
pub const FRAME_SEPARATOR: &str = "||";

/// Prefix marking a relay-to-relay gossip frame.
pub const RELAY_PREFIX: &str = "RELAY||";

/// Default number of frames admitted per source address within [`DEFAULT_RATE_INTERVAL`].
pub const DEFAULT_RATE_LIMIT: usize = 10;

/// Default sliding window for per-source rate limiting.
pub const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum accepted size of a single frame, in bytes (newline excluded).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum accepted size of the registration line.
pub const MAX_PEER_ID_SIZE: usize = 1024;

/// Default bound on connecting to a sibling relay.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on a single send to a peer or sibling relay.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// File name of the append-only message log inside the data directory.
pub const MESSAGE_LOG_FILE: &str = "relay_log.jsonl";

/// Plain-text notice sent when a frame is rejected by the rate limiter.
pub const RATE_LIMIT_NOTICE: &str = "[!] Rate limit exceeded.";
