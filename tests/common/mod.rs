//! Shared test helpers for KCP integration tests

#![allow(dead_code)]

use kcp_conversation::protocol::Command;
use kcp_conversation::{KcpConfig, KcpConversation, PacketHeader, Transport};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Datagram = (Vec<u8>, SocketAddr);

/// Returns true when the datagram should be dropped.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// In-memory datagram link. Each end delivers straight into the other's inbox.
pub struct ChannelTransport {
    local: SocketAddr,
    peer: mpsc::UnboundedSender<Datagram>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    filter: Mutex<Option<DropFilter>>,
    sent: AtomicUsize,
    dropped: AtomicUsize,
}

impl ChannelTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a_addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:10002".parse().unwrap();
        let (to_a, a_inbox) = mpsc::unbounded_channel();
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        let a = Arc::new(Self::new(a_addr, to_b, a_inbox));
        let b = Arc::new(Self::new(b_addr, to_a, b_inbox));
        (a, b)
    }

    fn new(
        local: SocketAddr,
        peer: mpsc::UnboundedSender<Datagram>,
        inbox: mpsc::UnboundedReceiver<Datagram>,
    ) -> Self {
        Self {
            local,
            peer,
            inbox: tokio::sync::Mutex::new(inbox),
            filter: Mutex::new(None),
            sent: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.filter.lock() = Some(filter);
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    type Addr = SocketAddr;

    async fn send_to(&self, packet: &[u8], _target: &SocketAddr) -> io::Result<usize> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let drop_it = match self.filter.lock().as_mut() {
            Some(filter) => filter(packet),
            None => false,
        };
        if drop_it {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(packet.len());
        }
        self.peer
            .send((packet.to_vec(), self.local))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (data, from) = inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }
}

/// Serial numbers of every PUSH segment in a datagram.
pub fn push_serials(packet: &[u8], has_conversation_id: bool) -> Vec<u32> {
    let mut serials = Vec::new();
    let mut rest = packet;
    while let Some((segment, consumed)) = PacketHeader::decode(rest, has_conversation_id) {
        if segment.header.command == Command::Push {
            serials.push(segment.header.serial_number);
        }
        rest = &rest[consumed..];
    }
    serials
}

/// Drops any datagram that carries the first transmission of a segment.
pub fn drop_first_transmission(has_conversation_id: bool) -> DropFilter {
    let mut seen = HashSet::new();
    Box::new(move |packet| {
        let mut fresh = false;
        for sn in push_serials(packet, has_conversation_id) {
            fresh |= seen.insert(sn);
        }
        fresh
    })
}

/// Drops datagrams at random with a fixed seed.
pub fn random_loss(rate: f64, seed: u64) -> DropFilter {
    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |_| rng.gen_bool(rate))
}

pub type Conversation = Arc<KcpConversation<ChannelTransport>>;

/// Two conversations wired to each other, each with a running receive pump.
pub fn connected_pair(config: KcpConfig) -> (Conversation, Conversation, Arc<ChannelTransport>) {
    let (a_transport, b_transport) = ChannelTransport::pair();
    let (a, b) = connect(config, a_transport.clone(), b_transport);
    (a, b, a_transport)
}

/// Like [`connected_pair`], dropping `rate` of the datagrams in each direction.
pub fn lossy_pair(config: KcpConfig, rate: f64, seed: u64) -> (Conversation, Conversation) {
    let (a_transport, b_transport) = ChannelTransport::pair();
    a_transport.set_drop_filter(random_loss(rate, seed));
    b_transport.set_drop_filter(random_loss(rate, seed.wrapping_add(1)));
    connect(config, a_transport, b_transport)
}

fn connect(
    config: KcpConfig,
    a_transport: Arc<ChannelTransport>,
    b_transport: Arc<ChannelTransport>,
) -> (Conversation, Conversation) {
    let a_addr = a_transport.local_addr();
    let b_addr = b_transport.local_addr();

    let a = Arc::new(KcpConversation::new(a_transport, b_addr, config.clone()).unwrap());
    let b = Arc::new(KcpConversation::new(b_transport, a_addr, config).unwrap());

    for conversation in [a.clone(), b.clone()] {
        tokio::spawn(async move {
            let _ = conversation.receive_from_transport().await;
        });
    }
    (a, b)
}

pub fn fast_config() -> KcpConfig {
    KcpConfig::new().fast_mode().conversation_id(0x4B43_5000)
}

/// Receive exactly `len` bytes in stream mode.
pub async fn read_exact(conversation: &Conversation, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];
    while out.len() < len {
        let result = conversation.receive_async(&mut buf, None).await.unwrap();
        assert!(!result.transport_closed, "closed after {} bytes", out.len());
        out.extend_from_slice(&buf[..result.bytes_received]);
    }
    out
}
