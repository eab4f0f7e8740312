//! Application Layer: typed messages, payload encryption, and the session
//! state machine.
//!
//! A session runs on top of a [`crate::transport::Endpoint`]:
//!
//! 1. After the transport handshake, the client introduces itself with
//!    `HELLO` and the server echoes its own identity.
//! 2. The client proposes a [`crate::Mode`] with `MODE_SELECT`; the server
//!    either echoes it (agreement) or answers `ERROR` and both sides close.
//! 3. In the secure modes the server generates a session key and ships it
//!    in a cleartext `KEY_EXCHANGE`; every later message in either
//!    direction is encrypted.
//! 4. `MSG` chat messages flow freely in both directions, each answered by
//!    an advisory `ACK_MSG` (delivery is already the transport's job).
//! 5. Either side says `BYE`; the peer echoes it and the transport is torn
//!    down with FIN.

pub mod crypto;
pub mod message;
pub mod session;

pub use crypto::{PayloadCipher, SessionKey};
pub use message::Message;
pub use session::{Session, SessionEvent, SessionPhase};
