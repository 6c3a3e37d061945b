//! # eddy-node: relay composition, storage, and connection handling.
//!
//! Composes the Eddy subsystems into a running relay:
//! - [`storage::DedupStore`]: content-addressed dedup set and message log
//! - [`handler`]: per-connection protocol state machine
//! - [`node::Relay`]: shared relay state and the accept loop
//! - [`config::RelayConfig`]: relay configuration

pub mod config;
pub mod handler;
pub mod node;
pub mod storage;

pub use config::RelayConfig;
pub use handler::handle_connection;
pub use node::{Relay, RelayStats};
pub use storage::DedupStore;
