//! Delivery classes and the `Transport` seam over the (external)
//! unreliable-datagram library (spec §6).
//!
//! The teacher talks directly to `UdpSocket`/`TcpStream` from `client.rs`/
//! `server.rs`. Here that's generalized behind a trait so C7/C8 depend on
//! delivery semantics, not a concrete socket type; [`UdpTransport`] is a
//! minimal real implementation used by the binaries and integration tests.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Delivery class requested for one outgoing datagram (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Voice frames, server → peer. PLC covers any drop.
    Unreliable,
    /// Voice frames, peer → server. In-order, drop-older.
    Sequenced,
    /// Control packets, entity events, handshake.
    ReliableOrdered,
    /// Info probes; no established session required.
    Unconnected,
}

/// What the core needs from the underlying datagram transport. The real
/// reliable/ordered guarantees for [`DeliveryClass::ReliableOrdered`] and
/// [`DeliveryClass::Sequenced`] are the transport library's job; this
/// trait only describes the shape the core calls through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, dest: SocketAddr, class: DeliveryClass, bytes: &[u8]) -> std::io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

/// Minimal UDP-backed transport. Delivery class is presently advisory —
/// ordering/reliability above raw UDP is the external transport library's
/// responsibility in the full system; this implementation exists so the
/// core's binaries and tests have something real to drive.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self { socket: UdpSocket::bind(addr).await? })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, dest: SocketAddr, _class: DeliveryClass, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, dest).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
