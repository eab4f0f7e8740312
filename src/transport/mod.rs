//! Transport Layer: reliable in-order delivery over an unreliable carrier.
//!
//! The transport is a Stop-and-Wait ARQ engine:
//!
//! 1. **Framing**: a fixed 14-byte header (version, flags, sequence and
//!    acknowledgment numbers, payload length, Internet Checksum) plus
//!    payload — see [`frame`].
//! 2. **Reliability**: one unacknowledged DATA frame at a time, retransmitted
//!    on timeout, with duplicate suppression on the receive side — see
//!    [`Endpoint`].
//! 3. **Connection lifecycle**: a SYN / SYN-ACK / ACK setup exchange and a
//!    FIN / ACK teardown, both retransmitted under the same rules as DATA.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │            Application payloads                 │
//! ├────────────────────────────────────────────────┤
//! │  Endpoint (ARQ: retransmit, dedup, SYN/FIN)    │
//! ├────────────────────────────────────────────────┤
//! │  Frame codec (header + checksum)               │
//! ├────────────────────────────────────────────────┤
//! │  Carrier (opaque byte frames)                  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! A frame that fails validation is treated exactly like a frame the
//! network dropped: the receiver stays silent and the sender's
//! retransmission heals the loss.

pub mod checksum;
pub mod endpoint;
pub mod frame;

pub use endpoint::{ConnState, Endpoint, ShutdownHandle, TransferStats};
pub use frame::{Frame, HEADER_SIZE};

/// Largest encoded frame the carriers must deliver intact.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + crate::MAX_PAYLOAD_SIZE;
