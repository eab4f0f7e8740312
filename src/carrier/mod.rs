//! Carrier Layer: the substrate that moves opaque frames.
//!
//! A carrier is a bidirectional, datagram-oriented transport of opaque byte
//! frames with a notion of peer address. It never splits or merges frames,
//! and it makes no delivery guarantees — reliability is the transport
//! layer's job.
//!
//! Two production carriers share the [`Carrier`] contract:
//!
//! * [`UdpCarrier`] — one UDP socket, one frame per datagram.
//! * [`ObfsClientCarrier`] / [`ObfsServerCarrier`] — frames tunneled as the
//!   bodies of HTTP POST requests and responses, so an on-path observer
//!   sees ordinary web traffic.
//!
//! [`MemoryCarrier`] is a paired in-process carrier with a programmable
//! drop hook, used to test loss, reordering of duplicates, and retry
//! exhaustion deterministically.

pub mod direct;
pub mod memory;
pub mod obfs;

pub use direct::UdpCarrier;
pub use memory::MemoryCarrier;
pub use obfs::{ObfsClientCarrier, ObfsServerCarrier};

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Address of the far side of a carrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    /// A datagram peer, addressed by socket address.
    Socket(SocketAddr),
    /// A tunnel peer, addressed by its stable client identifier.
    Client(String),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Socket(addr) => write!(f, "{addr}"),
            Peer::Client(id) => write!(f, "client:{id}"),
        }
    }
}

/// A bidirectional, unreliable, frame-preserving substrate.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Enqueue one frame for delivery to `peer`.
    ///
    /// May fail transiently with [`crate::Error::CarrierUnavailable`]; the
    /// transport layer retries. Must never split or merge frames.
    async fn send(&self, frame: &[u8], peer: &Peer) -> Result<()>;

    /// Receive exactly one frame, waiting at most `wait`.
    ///
    /// Returns [`crate::Error::Timeout`] when the deadline passes and
    /// [`crate::Error::CarrierClosed`] when no further frames can arrive.
    async fn recv(&self, wait: Duration) -> Result<(Bytes, Peer)>;

    /// Release the carrier's resources.
    async fn close(&self);
}
