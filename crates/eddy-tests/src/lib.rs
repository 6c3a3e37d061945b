//! Socket-level integration tests for Eddy relays.
//!
//! Every test here talks to a real relay over loopback TCP using the same
//! line protocol a chat client would. Single-relay behavior lives in
//! `tests/e2e.rs`; mesh flooding across several relays in
//! `tests/multi_relay.rs`.

pub mod helpers;
