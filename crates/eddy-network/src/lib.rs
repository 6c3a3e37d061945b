//! # eddy-network: wire and fan-out layer of an Eddy relay.
//!
//! Provides newline-delimited framing and frame parsing, the per-source
//! sliding-window [`RateLimiter`], the live [`ConnectionRegistry`] of local
//! peers, the static [`RelayDirectory`] of sibling relays, and the
//! [`FloodForwarder`] that pushes admitted entries to both.

pub mod config;
pub mod directory;
pub mod forwarder;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;

pub use config::NetworkConfig;
pub use directory::{RelayDirectory, RelayPeer, RelayRecord};
pub use forwarder::FloodForwarder;
pub use protocol::{Frame, ServerReply, read_frame};
pub use rate_limiter::RateLimiter;
pub use registry::{ConnectionRegistry, PeerConnection};
