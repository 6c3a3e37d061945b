//! Error types for the Eddy relay.
use thiserror::Error;

/// A frame that could not be parsed. Recovered locally: the sender is
/// notified and the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing '||' separator")] MissingSeparator,
    #[error("empty target")] EmptyTarget,
    #[error("invalid payload: {0}")] InvalidPayload(String),
    #[error("invalid gossip entry: {0}")] InvalidGossip(String),
    #[error("frame is not valid UTF-8")] InvalidUtf8,
    #[error("frame too large: {size} > {max}")] FrameTooLarge { size: usize, max: usize },
    #[error("client frames need a registered peer id")] Unregistered,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)] Protocol(#[from] ProtocolError),
    #[error("rate limit exceeded for {0}")] RateLimited(String),
    #[error("target '{0}' not found")] TargetNotFound(String),
    #[error("delivery to {peer} failed: {reason}")] Delivery { peer: String, reason: String },
    #[error("persistence: {0}")] Persistence(String),
    #[error("connection terminated: {0}")] ConnectionTerminated(String),
    #[error("relay directory: {0}")] Directory(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error ends the connection it was raised on.
    ///
    /// Only failures of the connection's own socket are fatal; everything
    /// else is reported to the sender or logged and the loop continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::ConnectionTerminated(_) | RelayError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display_is_readable() {
        assert_eq!(ProtocolError::MissingSeparator.to_string(), "missing '||' separator");
        assert_eq!(
            ProtocolError::FrameTooLarge { size: 10, max: 5 }.to_string(),
            "frame too large: 10 > 5"
        );
    }

    #[test]
    fn only_socket_failures_are_fatal() {
        assert!(RelayError::ConnectionTerminated("eof".into()).is_fatal());
        assert!(RelayError::Io(std::io::Error::other("reset")).is_fatal());
        assert!(!RelayError::TargetNotFound("bob".into()).is_fatal());
        assert!(!RelayError::RateLimited("127.0.0.1".into()).is_fatal());
        assert!(!RelayError::Persistence("disk full".into()).is_fatal());
        assert!(!RelayError::from(ProtocolError::EmptyTarget).is_fatal());
    }
}
