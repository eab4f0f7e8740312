//! Direct UDP carrier: one frame per datagram.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::carrier::{Carrier, Peer};
use crate::error::{Error, Result};
use crate::transport::MAX_FRAME_SIZE;

/// A carrier that maps `send`/`recv` onto single `sendto`/`recvfrom` calls
/// on one UDP socket.
#[derive(Debug)]
pub struct UdpCarrier {
    socket: UdpSocket,
}

impl UdpCarrier {
    /// Bind a socket. Servers bind their listen address; clients bind an
    /// ephemeral port (`0.0.0.0:0`).
    pub async fn bind(addr: impl Into<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(addr.into()).await?;
        tracing::debug!(local = %socket.local_addr()?, "udp carrier bound");
        Ok(Self { socket })
    }

    /// The locally bound address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Carrier for UdpCarrier {
    async fn send(&self, frame: &[u8], peer: &Peer) -> Result<()> {
        let Peer::Socket(addr) = peer else {
            return Err(Error::config("udp carrier requires a socket peer"));
        };
        match self.socket.send_to(frame, addr).await {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::unavailable(format!("udp send to {addr}: {e}"))),
        }
    }

    async fn recv(&self, wait: Duration) -> Result<(Bytes, Peer)> {
        let mut buf = [0u8; MAX_FRAME_SIZE + 1];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(e)) => Err(Error::Io(e)),
            Ok(Ok((n, addr))) => Ok((Bytes::copy_from_slice(&buf[..n]), Peer::Socket(addr))),
        }
    }

    async fn close(&self) {
        // Dropping the socket releases it; nothing else to flush.
    }
}
