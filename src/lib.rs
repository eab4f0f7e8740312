//! # omx — obfuscated message exchange
//!
//! A layered messaging stack that delivers reliable, optionally encrypted,
//! optionally traffic-obfuscated message exchange between one client and
//! one server.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Application Layer (session state machine, messages,    │
//! │  mode negotiation, AES-128-CBC payload encryption)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport Layer (Stop-and-Wait ARQ: sequence numbers,  │
//! │  acknowledgments, retransmission, Internet Checksum)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Carrier Layer (raw UDP datagrams, or HTTP-tunneled     │
//! │  request/response traffic for on-path observers)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each layer only sees the one below it: the session layer exchanges
//! [`app::Message`]s over a [`transport::Endpoint`], the endpoint exchanges
//! checksummed frames over a [`carrier::Carrier`], and the carrier moves
//! opaque byte frames. Swapping the UDP carrier for the HTTP tunnel changes
//! what an on-path observer sees, and nothing else.
//!
//! ## Modes
//!
//! A session runs in one of four modes, negotiated at connection setup:
//!
//! * `default` — plaintext payloads over UDP
//! * `secure` — AES-128-CBC payloads over UDP
//! * `obfs` — plaintext payloads through the HTTP tunnel
//! * `secure_obfs` — AES-128-CBC payloads through the HTTP tunnel
//!
//! In the secure modes the server generates a fresh 16-byte key per session
//! and ships it to the client in a cleartext `KEY_EXCHANGE` message. This is
//! a deliberate protocol limitation: there is no Diffie-Hellman exchange and
//! no message authentication, so the channel resists casual observation,
//! not an active or recording adversary.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod app;
pub mod carrier;
pub mod config;
pub mod error;
pub mod transport;

pub use config::{Config, Mode};
pub use error::{Error, Result};

/// Wire protocol version carried in every transport frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Application protocol version string exchanged in `HELLO`.
pub const APP_VERSION: &str = "1.0";

/// Largest payload a single frame may carry, chosen so that header plus
/// payload stays within what a datagram substrate delivers intact.
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Identity the server announces in its `HELLO` reply unless configured.
pub const DEFAULT_SERVER_ID: &str = "server_main";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_fits_in_a_datagram() {
        assert!(transport::frame::HEADER_SIZE + MAX_PAYLOAD_SIZE <= 1500);
    }

    #[test]
    fn test_version_constants() {
        assert_eq!(PROTOCOL_VERSION, 0x01);
        assert_eq!(APP_VERSION, "1.0");
    }
}
