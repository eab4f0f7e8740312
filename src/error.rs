//! Error types shared by every layer of the stack.

use thiserror::Error;

/// Result type alias for omx operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the carrier, transport, and session layers.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame failed version, flag, length, or checksum validation.
    /// Receivers treat this exactly like a dropped frame.
    #[error("invalid frame: {0}")]
    FrameInvalid(String),

    /// No frame (or no matching acknowledgment) arrived within the deadline.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// Retransmissions were exhausted without an acknowledgment.
    #[error("unreliable transport: no acknowledgment after {attempts} transmissions")]
    TransportUnreliable {
        /// How many times the frame went onto the wire.
        attempts: u32,
    },

    /// The operation was aborted by a shutdown request.
    #[error("transport cancelled by shutdown")]
    Cancelled,

    /// The substrate refused a frame but may accept it later.
    #[error("carrier unavailable: {0}")]
    CarrierUnavailable(String),

    /// The substrate is gone and will not deliver further frames.
    #[error("carrier closed")]
    CarrierClosed,

    /// Encryption or decryption failed (bad padding, wrong key, truncation).
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// An application message could not be decoded.
    #[error("invalid message: {0}")]
    MessageInvalid(String),

    /// The peers disagree on the session mode.
    #[error("mode mismatch: requested {requested}, serving {configured}")]
    ModeMismatch {
        /// Mode the client asked for.
        requested: String,
        /// Mode the server is configured with.
        configured: String,
    },

    /// A message arrived that the session state machine cannot accept.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The peer reported a protocol error and the session is closing.
    #[error("peer error {code}: {detail}")]
    Peer {
        /// Machine-readable error code from the peer's `ERROR` message.
        code: String,
        /// Human-readable detail from the peer.
        detail: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Substrate I/O error.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a frame-validation error.
    pub fn frame(msg: impl Into<String>) -> Self {
        Error::FrameInvalid(msg.into())
    }

    /// Create a cryptographic error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a handshake-sequencing error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a transient carrier error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::CarrierUnavailable(msg.into())
    }

    /// Whether the transport layer may recover from this error by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::CarrierUnavailable(_) | Error::FrameInvalid(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MessageInvalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout;
        assert_eq!(err.to_string(), "timed out waiting for a frame");

        let err = Error::TransportUnreliable { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "unreliable transport: no acknowledgment after 5 transmissions"
        );

        let err = Error::ModeMismatch {
            requested: "secure".into(),
            configured: "default".into(),
        };
        assert!(err.to_string().contains("secure"));
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::Timeout.is_recoverable());
        assert!(Error::unavailable("inbox full").is_recoverable());
        assert!(Error::frame("bad checksum").is_recoverable());
        assert!(!Error::TransportUnreliable { attempts: 5 }.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }
}
