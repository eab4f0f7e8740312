//! Typed application messages and their wire codec.
//!
//! Messages are JSON objects with a `type` tag and a type-specific
//! `payload` object, e.g.:
//!
//! ```json
//! {"type":"MSG","payload":{"text":"hello","sender":"client_17"}}
//! ```
//!
//! Tags and keys are case-sensitive. A buffer that does not decode —
//! unknown tag, missing field, not UTF-8, not JSON — is a
//! [`crate::Error::MessageInvalid`]; the session layer answers such input
//! with an `ERROR` message and closes.

use serde::{Deserialize, Serialize};

use crate::config::Mode;
use crate::error::Result;

/// Error code a session sends when a message cannot be decoded.
pub const ERR_PROTOCOL: &str = "PROTOCOL";
/// Error code for decryption failures.
pub const ERR_CRYPTO: &str = "CRYPTO";
/// Error code when the peers disagree on the session mode.
pub const ERR_MODE_MISMATCH: &str = "MODE_MISMATCH";

/// One application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Session opener: each side announces its identity and version.
    #[serde(rename = "HELLO")]
    Hello {
        /// Sender identity (client id, or the server's id in its reply).
        client_id: String,
        /// Application protocol version string.
        version: String,
    },

    /// Mode proposal from the client, echoed by the server on agreement.
    #[serde(rename = "MODE_SELECT")]
    ModeSelect {
        /// The proposed session mode.
        mode: Mode,
    },

    /// Server-generated session key, base64-encoded. Sent in cleartext;
    /// everything after it is encrypted in the secure modes.
    #[serde(rename = "KEY_EXCHANGE")]
    KeyExchange {
        /// 16-byte AES key, base64.
        key: String,
    },

    /// A chat message.
    #[serde(rename = "MSG")]
    Chat {
        /// Message body.
        text: String,
        /// Identity of the sender.
        sender: String,
    },

    /// Advisory application-level acknowledgment of a `MSG`.
    #[serde(rename = "ACK_MSG")]
    ChatAck {
        /// Optional identifier of the acknowledged message.
        #[serde(skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
    },

    /// Protocol error report; the sender is about to close.
    #[serde(rename = "ERROR")]
    Error {
        /// Machine-readable error code.
        code: String,
        /// Human-readable detail.
        detail: String,
    },

    /// Session farewell.
    #[serde(rename = "BYE")]
    Bye {
        /// Optional reason for disconnecting.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Message {
    /// Serialize to UTF-8 JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from UTF-8 JSON bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::ModeSelect { .. } => "MODE_SELECT",
            Message::KeyExchange { .. } => "KEY_EXCHANGE",
            Message::Chat { .. } => "MSG",
            Message::ChatAck { .. } => "ACK_MSG",
            Message::Error { .. } => "ERROR",
            Message::Bye { .. } => "BYE",
        }
    }

    /// Build the standard protocol-violation error reply.
    pub fn protocol_error(detail: impl Into<String>) -> Self {
        Message::Error {
            code: ERR_PROTOCOL.to_owned(),
            detail: detail.into(),
        }
    }
}
