//! Application-facing receive queue
//!
//! Holds in-order segments released from the receive window. In message mode
//! a message is complete once its fragment-0 segment has arrived; in stream
//! mode bytes are consumed across segment boundaries.

use crate::activation::UpdateActivation;
use crate::buffer_pool::PooledBuffer;
use crate::error::{CancelCause, KcpError, Result};
use crate::pending::{HasPendingSlot, OperationGuard, PendingSlot};

use bytes::Buf;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Outcome of a receive or peek.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveResult {
    pub bytes_received: usize,
    pub transport_closed: bool,
}

impl ReceiveResult {
    pub fn new(bytes_received: usize) -> Self {
        Self {
            bytes_received,
            transport_closed: false,
        }
    }

    pub fn closed() -> Self {
        Self {
            bytes_received: 0,
            transport_closed: true,
        }
    }
}

#[derive(Debug)]
struct ReceivedSegment {
    data: PooledBuffer,
    fragment: u8,
}

#[derive(Debug)]
struct ReceiveQueueState {
    queue: VecDeque<ReceivedSegment>,
    /// Segments with fragment 0, i.e. complete messages in message mode
    complete_messages: usize,
    pending: PendingSlot,
    closed: bool,
}

impl HasPendingSlot for ReceiveQueueState {
    fn pending(&mut self) -> &mut PendingSlot {
        &mut self.pending
    }
}

pub struct ReceiveQueue {
    state: Mutex<ReceiveQueueState>,
    notify: Notify,
    activation: Arc<UpdateActivation>,
    capacity: usize,
    stream_mode: bool,
}

impl ReceiveQueue {
    /// `capacity` is the receive window in segments; `preallocate` only sizes
    /// the initial storage.
    pub fn new(
        activation: Arc<UpdateActivation>,
        capacity: usize,
        preallocate: usize,
        stream_mode: bool,
    ) -> Self {
        Self {
            state: Mutex::new(ReceiveQueueState {
                queue: VecDeque::with_capacity(preallocate.min(capacity)),
                complete_messages: 0,
                pending: PendingSlot::default(),
                closed: false,
            }),
            notify: Notify::new(),
            activation,
            capacity,
            stream_mode,
        }
    }

    // ── Non-blocking ────────────────────────────────────────────────────

    /// Size of the next message (message mode) or of all buffered bytes
    /// (stream mode).
    ///
    /// `None` means nothing is available yet; a closed transport yields
    /// [`ReceiveResult::closed`].
    pub fn try_peek(&self) -> Result<Option<ReceiveResult>> {
        let mut state = self.state.lock();
        state.pending.ensure_idle()?;
        if state.closed {
            return Ok(Some(ReceiveResult::closed()));
        }
        Ok(self.peek_size(&state).map(ReceiveResult::new))
    }

    /// Copy the next message (or as many stream bytes as fit) into `buf`.
    ///
    /// In message mode a buffer smaller than the message is an
    /// [`KcpError::InvalidArgument`] and the message stays queued.
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<ReceiveResult>> {
        let result = {
            let mut state = self.state.lock();
            state.pending.ensure_idle()?;
            if state.closed {
                return Ok(Some(ReceiveResult::closed()));
            }
            self.receive_locked(&mut state, buf)?
        };
        if result.is_some() {
            self.activation.notify();
        }
        Ok(result)
    }

    // ── Async operations ────────────────────────────────────────────────

    /// Wait for data, then receive it into `buf`.
    pub async fn receive_async(
        &self,
        buf: &mut [u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<ReceiveResult> {
        let guard = OperationGuard::begin(&self.state)?;
        let result = guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(ReceiveResult::closed()));
                }
                self.receive_locked(state, buf).transpose()
            })
            .await?;
        if !result.transport_closed {
            self.activation.notify();
        }
        Ok(result)
    }

    /// Wait until a message (or any stream bytes) is available and report
    /// its size without consuming it.
    pub async fn wait_to_receive(&self, cancel: Option<&CancellationToken>) -> Result<ReceiveResult> {
        let guard = OperationGuard::begin(&self.state)?;
        guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(ReceiveResult::closed()));
                }
                self.peek_size(state).map(|size| Ok(ReceiveResult::new(size)))
            })
            .await
    }

    /// Wait until at least `min_bytes` bytes in `min_segments` segments are
    /// buffered.
    pub async fn wait_for_available_data(
        &self,
        min_bytes: usize,
        min_segments: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if min_segments > self.capacity {
            return Err(KcpError::invalid_argument(
                "Requested segment count exceeds the receive queue capacity",
            ));
        }

        let guard = OperationGuard::begin(&self.state)?;
        guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(false));
                }
                let bytes: usize = state.queue.iter().map(|s| s.data.len()).sum();
                (bytes >= min_bytes && state.queue.len() >= min_segments).then_some(Ok(true))
            })
            .await
    }

    /// Cancel the pending operation. Returns false if nothing was pending.
    pub fn cancel_pending_operation(&self, cause: Option<CancelCause>) -> bool {
        let cancelled = self.state.lock().pending.cancel(cause);
        if cancelled {
            self.notify.notify_one();
        }
        cancelled
    }

    // ── Control loop side ───────────────────────────────────────────────

    /// Segments currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an in-order segment from the receive window.
    ///
    /// Stream mode drops empty segments. Returns false once closed.
    pub fn enqueue(&self, data: PooledBuffer, fragment: u8) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if self.stream_mode && data.is_empty() {
            return true;
        }
        let fragment = if self.stream_mode { 0 } else { fragment };
        if fragment == 0 {
            state.complete_messages += 1;
        }
        state.queue.push_back(ReceivedSegment { data, fragment });
        let waiting = state.pending.is_active();
        drop(state);

        if waiting {
            self.notify.notify_one();
        }
        true
    }

    /// Drop everything buffered and resolve pending and future operations as
    /// closed.
    pub fn set_transport_closed(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.complete_messages = 0;
            std::mem::take(&mut state.queue)
        };
        drop(dropped);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn peek_size(&self, state: &ReceiveQueueState) -> Option<usize> {
        if self.stream_mode {
            let total: usize = state.queue.iter().map(|s| s.data.len()).sum();
            return (total > 0).then_some(total);
        }
        if state.complete_messages == 0 {
            return None;
        }
        let mut size = 0;
        for segment in &state.queue {
            size += segment.data.len();
            if segment.fragment == 0 {
                break;
            }
        }
        Some(size)
    }

    fn receive_locked(
        &self,
        state: &mut ReceiveQueueState,
        buf: &mut [u8],
    ) -> Result<Option<ReceiveResult>> {
        if self.stream_mode {
            return Ok(Self::receive_stream(state, buf));
        }

        let Some(size) = self.peek_size(state) else {
            return Ok(None);
        };
        if size > buf.len() {
            return Err(KcpError::invalid_argument(format!(
                "Buffer of {} bytes is too small for a {size}-byte message",
                buf.len()
            )));
        }

        let mut copied = 0;
        while let Some(segment) = state.queue.pop_front() {
            let len = segment.data.len();
            buf[copied..copied + len].copy_from_slice(&segment.data);
            copied += len;
            if segment.fragment == 0 {
                state.complete_messages -= 1;
                break;
            }
        }
        Ok(Some(ReceiveResult::new(copied)))
    }

    fn receive_stream(state: &mut ReceiveQueueState, buf: &mut [u8]) -> Option<ReceiveResult> {
        if state.queue.is_empty() {
            return None;
        }

        let mut copied = 0;
        while copied < buf.len() {
            let Some(head) = state.queue.front_mut() else {
                break;
            };
            let take = head.data.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&head.data[..take]);
            head.data.advance(take);
            copied += take;

            if head.data.is_empty() {
                state.queue.pop_front();
                state.complete_messages -= 1;
            }
        }
        Some(ReceiveResult::new(copied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::{BufferPool, DefaultBufferPool};
    use std::time::Duration;

    fn setup(capacity: usize, stream_mode: bool) -> (Arc<ReceiveQueue>, Arc<dyn BufferPool>) {
        let activation = UpdateActivation::new(Duration::from_secs(3600));
        (
            Arc::new(ReceiveQueue::new(activation, capacity, capacity, stream_mode)),
            DefaultBufferPool::shared(),
        )
    }

    #[tokio::test]
    async fn test_message_waits_for_last_fragment() {
        let (queue, pool) = setup(8, false);
        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"hel"), 1);
        assert_eq!(queue.try_peek().unwrap(), None);

        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"lo"), 0);
        assert_eq!(queue.try_peek().unwrap(), Some(ReceiveResult::new(5)));

        let mut small = [0u8; 4];
        assert!(matches!(
            queue.try_receive(&mut small),
            Err(KcpError::InvalidArgument { .. })
        ));

        let mut buf = [0u8; 16];
        let result = queue.try_receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..result.bytes_received], b"hello");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_stream_partial_reads() {
        let (queue, pool) = setup(8, true);
        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"abc"), 0);
        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b""), 0);
        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"defg"), 0);
        assert_eq!(queue.len(), 2);

        let mut buf = [0u8; 5];
        assert_eq!(queue.try_receive(&mut buf).unwrap(), Some(ReceiveResult::new(5)));
        assert_eq!(&buf, b"abcde");

        assert_eq!(queue.try_peek().unwrap(), Some(ReceiveResult::new(2)));
        assert_eq!(queue.try_receive(&mut buf).unwrap(), Some(ReceiveResult::new(2)));
        assert_eq!(&buf[..2], b"fg");
        assert_eq!(queue.try_receive(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_receive_async_wakes_on_enqueue() {
        let (queue, pool) = setup(8, false);
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let result = queue.receive_async(&mut buf, None).await.unwrap();
                buf[..result.bytes_received].to_vec()
            })
        };
        tokio::task::yield_now().await;
        assert!(matches!(queue.try_peek(), Err(KcpError::ConcurrentOperation)));

        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"ping"), 0);
        assert_eq!(receiver.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_close_resolves_waiters() {
        let (queue, pool) = setup(8, false);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_available_data(10, 1, None).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"tiny"), 0);
        queue.set_transport_closed();

        assert!(!waiter.await.unwrap().unwrap());
        assert_eq!(queue.try_peek().unwrap(), Some(ReceiveResult::closed()));
        assert!(!queue.enqueue(PooledBuffer::copy_from_slice(&pool, b"late"), 0));
    }

    #[tokio::test]
    async fn test_token_cancels_wait() {
        let (queue, _) = setup(8, false);
        let token = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.wait_to_receive(Some(&token)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
    }
}
