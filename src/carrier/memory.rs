//! In-memory paired carrier for deterministic testing.
//!
//! [`MemoryCarrier::pair`] returns two connected carriers. Frames sent on
//! one side appear on the other unless the sender's *wire hook* drops them,
//! which is how tests simulate loss, single-frame drops, or a dead link.
//! The hook also sees every frame that passes, so tests can capture a wire
//! trace.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::carrier::{Carrier, Peer};
use crate::error::{Error, Result};

/// Decides the fate of one outgoing frame: `true` lets it through.
pub type WireHook = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Link {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: Mutex<bool>,
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: Mutex::new(false),
        })
    }
}

/// One side of an in-process frame link.
pub struct MemoryCarrier {
    /// Frames destined for us.
    rx: Arc<Link>,
    /// Frames destined for the peer.
    tx: Arc<Link>,
    /// Synthetic address of the far side.
    peer_addr: SocketAddr,
    hook: Mutex<Option<WireHook>>,
}

impl MemoryCarrier {
    /// Create a connected pair.
    pub fn pair() -> (Self, Self) {
        let ab = Link::new();
        let ba = Link::new();
        let addr_a = SocketAddr::from(([127, 0, 0, 1], 1));
        let addr_b = SocketAddr::from(([127, 0, 0, 1], 2));

        let a = Self {
            rx: Arc::clone(&ba),
            tx: Arc::clone(&ab),
            peer_addr: addr_b,
            hook: Mutex::new(None),
        };
        let b = Self {
            rx: ab,
            tx: ba,
            peer_addr: addr_a,
            hook: Mutex::new(None),
        };
        (a, b)
    }

    /// The peer address frames from this side carry.
    pub fn peer(&self) -> Peer {
        Peer::Socket(self.peer_addr)
    }

    /// Install a hook that observes every outgoing frame and decides
    /// whether it reaches the other side.
    pub fn set_wire_hook(&self, hook: WireHook) {
        *self.hook.lock() = Some(hook);
    }
}

#[async_trait]
impl Carrier for MemoryCarrier {
    async fn send(&self, frame: &[u8], _peer: &Peer) -> Result<()> {
        if *self.tx.closed.lock() {
            return Err(Error::CarrierClosed);
        }
        let deliver = match &*self.hook.lock() {
            Some(hook) => hook(frame),
            None => true,
        };
        if deliver {
            self.tx.queue.lock().push_back(Bytes::copy_from_slice(frame));
            self.tx.notify.notify_one();
        }
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<(Bytes, Peer)> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.rx.queue.lock().pop_front() {
                return Ok((frame, self.peer()));
            }
            if *self.rx.closed.lock() {
                return Err(Error::CarrierClosed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.rx.notify.notified()).await;
        }
    }

    async fn close(&self) {
        *self.tx.closed.lock() = true;
        *self.rx.closed.lock() = true;
        self.tx.notify.notify_waiters();
        self.rx.notify.notify_waiters();
    }
}
