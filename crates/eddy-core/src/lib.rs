//! # eddy-core
//! Foundation types, protocol constants, and the error taxonomy shared by
//! every Eddy relay crate.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ProtocolError, RelayError};
pub use types::{MessageEntry, MsgId, Target};
