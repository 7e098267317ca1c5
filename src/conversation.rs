//! A reliable conversation with one remote endpoint
//!
//! [`KcpConversation`] ties the queues, the engine and a transport together.
//! The engine lives inside a spawned control loop that wakes on the update
//! timer, on inbound packets and on queue activity; application calls only
//! touch the lock-protected queues.

use crate::activation::{InboundPacket, UpdateActivation};
use crate::buffer_pool::{BufferPool, DefaultBufferPool, PooledBuffer};
use crate::config::KcpConfig;
use crate::engine::KcpEngine;
use crate::error::{CancelCause, ConnectionError, KcpError, Result};
use crate::metrics::global_metrics;
use crate::protocol::{current_timestamp, ConvId, KcpStats, PacketHeader};
use crate::receive_queue::{ReceiveQueue, ReceiveResult};
use crate::send_queue::SendQueue;
use crate::transport::Transport;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

/// Decides whether a transport send failure is survivable.
///
/// Return `true` to keep the conversation running, `false` to close it.
pub type ExceptionHandler = Arc<dyn Fn(&KcpError) -> bool + Send + Sync>;

/// Largest datagram [`KcpConversation::receive_from_transport`] reads.
const MAX_DATAGRAM: usize = 65536;

struct Shared<T: Transport> {
    transport: Arc<T>,
    remote: T::Addr,
    conversation_id: Option<ConvId>,
    stream_mode: bool,
    pool: Arc<dyn BufferPool>,
    send_queue: Arc<SendQueue>,
    receive_queue: Arc<ReceiveQueue>,
    activation: Arc<UpdateActivation>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<ConnectionError>>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    stats: Mutex<KcpStats>,
}

impl<T: Transport> Shared<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent: stop the loop and resolve every pending operation.
    fn set_transport_closed(&self, reason: ConnectionError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        self.shutdown.cancel();
        self.activation.dispose();
        self.send_queue.set_transport_closed();
        self.receive_queue.set_transport_closed();
        info!(conv = ?self.conversation_id, remote = %self.remote, reason = %reason, "Conversation closed");
    }

    /// Route a send failure through the exception handler.
    /// Returns whether the conversation keeps running.
    fn handle_exception(&self, error: &KcpError) -> bool {
        let handler = self.exception_handler.lock().clone();
        let keep_running = handler.is_some_and(|handler| handler(error));
        if keep_running {
            warn!(error = %error, "Transport error ignored by exception handler");
        } else {
            error!(error = %error, "Transport error, closing conversation");
            self.set_transport_closed(ConnectionError::Closed);
        }
        keep_running
    }
}

/// A KCP conversation over transport `T`.
///
/// Dropping the conversation closes it.
pub struct KcpConversation<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> KcpConversation<T> {
    /// Create a conversation using the process-wide buffer pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<T>, remote: T::Addr, config: KcpConfig) -> Result<Self> {
        Self::with_buffer_pool(transport, remote, config, DefaultBufferPool::shared())
    }

    pub fn with_buffer_pool(
        transport: Arc<T>,
        remote: T::Addr,
        config: KcpConfig,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        config.validate()?;

        let interval = config.effective_interval();
        let activation = UpdateActivation::new(Duration::from_millis(interval as u64));
        let send_queue = Arc::new(SendQueue::new(
            activation.clone(),
            pool.clone(),
            config.effective_send_queue_size(),
            config.mss(),
            config.stream_mode,
        ));
        let receive_queue = Arc::new(ReceiveQueue::new(
            activation.clone(),
            config.effective_rcv_wnd() as usize,
            config.effective_receive_queue_size(),
            config.stream_mode,
        ));
        let engine = KcpEngine::new(
            &config,
            send_queue.clone(),
            receive_queue.clone(),
            pool.clone(),
            current_timestamp(),
        );

        let shared = Arc::new(Shared {
            transport,
            remote,
            conversation_id: config.conversation_id,
            stream_mode: config.stream_mode,
            pool,
            send_queue,
            receive_queue,
            activation,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            close_reason: Mutex::new(None),
            exception_handler: Mutex::new(None),
            stats: Mutex::new(engine.stats()),
        });

        global_metrics().conversation_created();
        info!(
            conv = ?config.conversation_id,
            remote = %shared.remote,
            mtu = config.mtu,
            stream = config.stream_mode,
            "Conversation started"
        );
        tokio::spawn(run_update_loop(shared.clone(), engine));

        Ok(Self { shared })
    }

    // ── Properties ──────────────────────────────────────────────────────

    pub fn conversation_id(&self) -> Option<ConvId> {
        self.shared.conversation_id
    }

    pub fn stream_mode(&self) -> bool {
        self.shared.stream_mode
    }

    pub fn remote_addr(&self) -> &T::Addr {
        &self.shared.remote
    }

    /// Snapshot of the protocol counters, refreshed after every loop pass.
    pub fn stats(&self) -> KcpStats {
        *self.shared.stats.lock()
    }

    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&KcpError) -> bool + Send + Sync + 'static,
    {
        *self.shared.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub fn is_transport_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the conversation closed, once it has.
    pub fn close_reason(&self) -> Option<ConnectionError> {
        *self.shared.close_reason.lock()
    }

    /// Close the conversation. Pending operations resolve as closed and
    /// buffered data is released.
    pub fn set_transport_closed(&self) {
        self.shared.set_transport_closed(ConnectionError::Closed);
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// See [`SendQueue::try_send`].
    pub fn try_send(&self, data: &[u8]) -> Result<bool> {
        self.shared.send_queue.try_send(data)
    }

    /// Stream mode only; see [`SendQueue::try_send_partial`].
    pub fn try_send_partial(&self, data: &[u8]) -> Result<Option<usize>> {
        self.shared.send_queue.try_send_partial(data)
    }

    /// Queue `data`, waiting for send queue space. `Ok(false)` means the
    /// conversation closed first.
    pub async fn send_async(&self, data: &[u8], cancel: Option<&CancellationToken>) -> Result<bool> {
        self.shared.send_queue.send_async(data, cancel).await
    }

    pub async fn wait_for_send_queue_space(
        &self,
        min_bytes: usize,
        min_segments: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        self.shared
            .send_queue
            .wait_for_available_space(min_bytes, min_segments, cancel)
            .await
    }

    /// Wait until everything queued so far is acknowledged by the peer.
    pub async fn flush_async(&self, cancel: Option<&CancellationToken>) -> Result<bool> {
        self.shared.send_queue.flush_async(cancel).await
    }

    pub fn cancel_pending_send(&self, cause: Option<CancelCause>) -> bool {
        self.shared.send_queue.cancel_pending_operation(cause)
    }

    /// Bytes queued or in flight and not yet acknowledged.
    pub fn unflushed_bytes(&self) -> usize {
        self.shared.send_queue.unflushed_bytes()
    }

    /// Free (bytes, segments) in the send queue, `None` once closed.
    pub fn send_queue_available_space(&self) -> Option<(usize, usize)> {
        self.shared.send_queue.available_space()
    }

    // ── Receiving ───────────────────────────────────────────────────────

    pub fn try_peek(&self) -> Result<Option<ReceiveResult>> {
        self.shared.receive_queue.try_peek()
    }

    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<ReceiveResult>> {
        self.shared.receive_queue.try_receive(buf)
    }

    pub async fn receive_async(
        &self,
        buf: &mut [u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<ReceiveResult> {
        self.shared.receive_queue.receive_async(buf, cancel).await
    }

    /// Wait for the next message and report its size without consuming it.
    pub async fn wait_to_receive(&self, cancel: Option<&CancellationToken>) -> Result<ReceiveResult> {
        self.shared.receive_queue.wait_to_receive(cancel).await
    }

    pub async fn wait_for_receive_queue_data(
        &self,
        min_bytes: usize,
        min_segments: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        self.shared
            .receive_queue
            .wait_for_available_data(min_bytes, min_segments, cancel)
            .await
    }

    pub fn cancel_pending_receive(&self, cause: Option<CancelCause>) -> bool {
        self.shared.receive_queue.cancel_pending_operation(cause)
    }

    // ── Inbound packets ─────────────────────────────────────────────────

    /// Hand an inbound datagram to the control loop without waiting.
    ///
    /// Datagrams that are too short, carry a foreign conversation ID or
    /// declare a payload longer than themselves are dropped. Returns whether
    /// the packet was queued.
    pub fn input_packet(&self, packet: &[u8]) -> bool {
        match self.prepare_inbound(packet) {
            Some(data) => self.shared.activation.input_packet(InboundPacket::new(data)),
            None => false,
        }
    }

    /// Like [`input_packet`](Self::input_packet), but resolves once the control
    /// loop has processed (or discarded) the packet.
    pub async fn input_packet_async(
        &self,
        packet: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let Some(data) = self.prepare_inbound(packet) else {
            return Ok(());
        };
        let (packet, processed) = InboundPacket::with_completion(data);
        if !self.shared.activation.input_packet(packet) {
            return Ok(());
        }

        match cancel {
            Some(token) => tokio::select! {
                _ = processed => Ok(()),
                _ = token.cancelled() => Err(KcpError::cancelled(None)),
            },
            None => {
                let _ = processed.await;
                Ok(())
            }
        }
    }

    /// Read datagrams from the transport and feed those from the remote
    /// endpoint into this conversation until it closes.
    pub async fn receive_from_transport(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                received = self.shared.transport.recv_from(&mut buf) => received?,
                _ = self.shared.shutdown.cancelled() => return Ok(()),
            };
            if from != self.shared.remote {
                trace!(from = %from, "Ignoring datagram from unknown endpoint");
                continue;
            }
            self.input_packet_async(&buf[..len], None).await?;
        }
    }

    fn prepare_inbound(&self, packet: &[u8]) -> Option<PooledBuffer> {
        let (segment, _) = PacketHeader::decode(packet, self.shared.conversation_id.is_some())?;
        if segment.conversation_id != self.shared.conversation_id {
            return None;
        }
        Some(PooledBuffer::copy_from_slice(&self.shared.pool, packet))
    }
}

impl<T: Transport> Drop for KcpConversation<T> {
    fn drop(&mut self) {
        self.shared.set_transport_closed(ConnectionError::Closed);
    }
}

// ── Control loop ────────────────────────────────────────────────────────

async fn run_update_loop<T: Transport>(shared: Arc<Shared<T>>, mut engine: KcpEngine) {
    loop {
        let notification = match shared.activation.wait().await {
            Ok(notification) if !notification.is_empty() => notification,
            Ok(_) => break,
            Err(e) => {
                error!(error = %e, "Update activation failed, stopping loop");
                break;
            }
        };
        if shared.is_closed() {
            break;
        }

        let current = current_timestamp();
        let mut update = notification.timer;
        if let Some(packet) = notification.packet {
            update |= engine.input(packet.data(), current);
        }
        update |= engine.drain_receive_buffer();

        if update && engine.update(current) && !send_output(&shared, &mut engine).await {
            break;
        }
        *shared.stats.lock() = engine.stats();

        if engine.is_dead() {
            global_metrics().conversation_lost();
            shared.set_transport_closed(ConnectionError::Lost);
            break;
        }
        if engine.is_idle_expired(current_timestamp()) {
            global_metrics().conversation_timed_out();
            shared.set_transport_closed(ConnectionError::Timeout);
            break;
        }
    }

    engine.close();
    let stats = engine.stats();
    *shared.stats.lock() = stats;
    shared.set_transport_closed(ConnectionError::Closed);
    global_metrics().conversation_closed(&stats);
    trace!("Update loop stopped");
}

/// Send everything the engine produced. Returns false once the conversation
/// is closed.
async fn send_output<T: Transport>(shared: &Shared<T>, engine: &mut KcpEngine) -> bool {
    for packet in engine.drain_output() {
        if shared.is_closed() {
            return false;
        }
        trace!(bytes = packet.len(), "Sending packet");
        if let Err(e) = shared.transport.send_to(&packet, &shared.remote).await {
            if !shared.handle_exception(&KcpError::Io(e)) {
                return false;
            }
        }
    }
    !shared.is_closed()
}
