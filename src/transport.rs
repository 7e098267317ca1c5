//! Datagram transport consumed by a conversation
//!
//! A conversation only needs to hand finished packets to something that can
//! deliver datagrams to its remote endpoint. [`UdpTransport`] covers the
//! common case; tests and custom framings implement [`Transport`] directly.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Marker trait for endpoint address types.
///
/// Blanket-implemented for every type meeting the bounds.
pub trait Addr: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static> Addr for T {}

/// Async datagram transport.
///
/// `send_to` must deliver one datagram per call; a conversation never splits
/// a packet across calls. Errors are routed to the conversation's exception
/// handler.
pub trait Transport: Send + Sync + 'static {
    type Addr: Addr;

    /// Send one packet to `target`.
    fn send_to<'a>(
        &'a self,
        packet: &'a [u8],
        target: &'a Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive one datagram into `buf`, returning its length and source.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Self::Addr)>> + Send + 'a;
}

/// [`Transport`] over a Tokio UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    type Addr = SocketAddr;

    async fn send_to(&self, packet: &[u8], target: &SocketAddr) -> io::Result<usize> {
        self.socket.send_to(packet, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
