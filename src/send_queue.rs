//! Application-facing send queue
//!
//! Bounded in segments. Message mode splits each message into at most 256
//! fragments numbered down to 0; stream mode fills the tail segment before
//! starting a new one. The control loop drains the queue into the send window
//! with [`SendQueue::try_dequeue`].

use crate::activation::UpdateActivation;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::{CancelCause, KcpError, Result};
use crate::pending::{HasPendingSlot, OperationGuard, PendingSlot};
use crate::protocol::constants;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A segment waiting to enter the send window.
#[derive(Debug)]
pub struct QueuedSegment {
    pub data: PooledBuffer,
    pub fragment: u8,
}

#[derive(Debug)]
struct SendQueueState {
    queue: VecDeque<QueuedSegment>,
    /// Bytes queued or in flight but not yet acknowledged
    unflushed_bytes: usize,
    send_window_empty: bool,
    ack_list_empty: bool,
    pending: PendingSlot,
    closed: bool,
}

impl HasPendingSlot for SendQueueState {
    fn pending(&mut self) -> &mut PendingSlot {
        &mut self.pending
    }
}

pub struct SendQueue {
    state: Mutex<SendQueueState>,
    notify: Notify,
    activation: Arc<UpdateActivation>,
    pool: Arc<dyn BufferPool>,
    capacity: usize,
    mss: usize,
    stream_mode: bool,
}

impl SendQueue {
    pub fn new(
        activation: Arc<UpdateActivation>,
        pool: Arc<dyn BufferPool>,
        capacity: usize,
        mss: usize,
        stream_mode: bool,
    ) -> Self {
        Self {
            state: Mutex::new(SendQueueState {
                queue: VecDeque::with_capacity(capacity),
                unflushed_bytes: 0,
                send_window_empty: true,
                ack_list_empty: true,
                pending: PendingSlot::default(),
                closed: false,
            }),
            notify: Notify::new(),
            activation,
            pool,
            capacity,
            mss,
            stream_mode,
        }
    }

    // ── Non-blocking sends ──────────────────────────────────────────────

    /// Queue `data` if it fits entirely. Returns `Ok(false)` when the queue is
    /// full or the transport is closed.
    pub fn try_send(&self, data: &[u8]) -> Result<bool> {
        let count = self.check_message(data)?;
        let mut state = self.state.lock();
        state.pending.ensure_idle()?;
        if state.closed {
            return Ok(false);
        }

        let queued = if self.stream_mode {
            let (free_bytes, _) = self.free_space(&state);
            if free_bytes < data.len() {
                false
            } else {
                self.enqueue_stream(&mut state, data);
                true
            }
        } else if self.capacity - state.queue.len() < count {
            false
        } else {
            self.enqueue_message(&mut state, data, count);
            true
        };
        drop(state);

        if queued && !data.is_empty() {
            self.activation.notify();
        }
        Ok(queued)
    }

    /// Stream mode only: queue as much of `data` as fits.
    ///
    /// Returns `None` once the transport is closed, otherwise the number of
    /// bytes accepted.
    pub fn try_send_partial(&self, data: &[u8]) -> Result<Option<usize>> {
        if !self.stream_mode {
            return Err(KcpError::invalid_argument(
                "Partial sends are only supported in stream mode",
            ));
        }
        let mut state = self.state.lock();
        state.pending.ensure_idle()?;
        if state.closed {
            return Ok(None);
        }
        let written = self.enqueue_stream(&mut state, data);
        drop(state);

        if written > 0 {
            self.activation.notify();
        }
        Ok(Some(written))
    }

    // ── Async operations ────────────────────────────────────────────────

    /// Queue `data`, waiting for space as needed.
    ///
    /// Stream mode writes progressively as segments free up. Returns
    /// `Ok(false)` if the transport closes first.
    pub async fn send_async(&self, data: &[u8], cancel: Option<&CancellationToken>) -> Result<bool> {
        let count = self.check_message(data)?;
        if !self.stream_mode && count > self.capacity {
            return Err(KcpError::invalid_argument(format!(
                "Message needs {count} segments but the send queue holds {}",
                self.capacity
            )));
        }

        let guard = OperationGuard::begin(&self.state)?;
        let mut offset = 0;
        guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(false));
                }
                if self.stream_mode {
                    let written = self.enqueue_stream(state, &data[offset..]);
                    offset += written;
                    if written > 0 {
                        self.activation.notify();
                    }
                    (offset == data.len()).then_some(Ok(true))
                } else if self.capacity - state.queue.len() >= count {
                    self.enqueue_message(state, data, count);
                    if !data.is_empty() {
                        self.activation.notify();
                    }
                    Some(Ok(true))
                } else {
                    None
                }
            })
            .await
    }

    /// Wait until at least `min_bytes` bytes and `min_segments` segments are
    /// free.
    pub async fn wait_for_available_space(
        &self,
        min_bytes: usize,
        min_segments: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        if min_segments > self.capacity || min_bytes > self.capacity * self.mss {
            return Err(KcpError::invalid_argument(
                "Requested space exceeds the send queue capacity",
            ));
        }

        let guard = OperationGuard::begin(&self.state)?;
        guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(false));
                }
                let (bytes, segments) = self.free_space(state);
                (bytes >= min_bytes && segments >= min_segments).then_some(Ok(true))
            })
            .await
    }

    /// Wait until every queued byte has been acknowledged and every pending
    /// acknowledgment has been sent.
    pub async fn flush_async(&self, cancel: Option<&CancellationToken>) -> Result<bool> {
        let guard = OperationGuard::begin(&self.state)?;
        self.activation.notify();
        guard
            .wait(&self.notify, cancel, |state| {
                if state.closed {
                    return Some(Ok(false));
                }
                Self::is_flushed(state).then_some(Ok(true))
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

    // ── Queries ─────────────────────────────────────────────────────────

    /// Free (bytes, segments), or `None` once closed.
    pub fn available_space(&self) -> Option<(usize, usize)> {
        let state = self.state.lock();
        (!state.closed).then(|| self.free_space(&state))
    }

    pub fn unflushed_bytes(&self) -> usize {
        self.state.lock().unflushed_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ── Control loop side ───────────────────────────────────────────────

    /// Take the next segment for the send window.
    pub fn try_dequeue(&self) -> Option<QueuedSegment> {
        let mut state = self.state.lock();
        let segment = state.queue.pop_front()?;
        state.send_window_empty = false;
        let waiting = state.pending.is_active();
        drop(state);

        if waiting {
            self.notify.notify_one();
        }
        Some(segment)
    }

    /// Account for payload bytes released by acknowledgment.
    pub fn subtract_unflushed_bytes(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.unflushed_bytes = state.unflushed_bytes.saturating_sub(bytes);
    }

    /// Report whether the send window and ack list have drained.
    pub fn update_engine_state(&self, send_window_empty: bool, ack_list_empty: bool) {
        let mut state = self.state.lock();
        state.send_window_empty = send_window_empty;
        state.ack_list_empty = ack_list_empty;
        let wake = state.pending.is_active() && Self::is_flushed(&state);
        drop(state);

        if wake {
            self.notify.notify_one();
        }
    }

    /// Drop every queued segment and resolve pending and future operations
    /// as closed.
    pub fn set_transport_closed(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.unflushed_bytes = 0;
            std::mem::take(&mut state.queue)
        };
        drop(dropped);
        self.notify.notify_one();
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Segment count for a message; only message mode has a fragment limit.
    fn check_message(&self, data: &[u8]) -> Result<usize> {
        let count = data.len().div_ceil(self.mss).max(1);
        if !self.stream_mode && count > constants::IKCP_FRAGMENT_MAX {
            return Err(KcpError::invalid_argument(format!(
                "Message of {} bytes needs {count} fragments, limit is {}",
                data.len(),
                constants::IKCP_FRAGMENT_MAX
            )));
        }
        Ok(count)
    }

    fn is_flushed(state: &SendQueueState) -> bool {
        state.queue.is_empty()
            && state.unflushed_bytes == 0
            && state.send_window_empty
            && state.ack_list_empty
    }

    fn free_space(&self, state: &SendQueueState) -> (usize, usize) {
        let segments = self.capacity - state.queue.len();
        let mut bytes = segments * self.mss;
        if self.stream_mode {
            if let Some(tail) = state.queue.back() {
                bytes += self.mss - tail.data.len();
            }
        }
        (bytes, segments)
    }

    fn enqueue_message(&self, state: &mut SendQueueState, data: &[u8], count: usize) {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(self.mss).collect()
        };
        debug_assert_eq!(chunks.len(), count);

        for (i, chunk) in chunks.into_iter().enumerate() {
            state.queue.push_back(QueuedSegment {
                data: PooledBuffer::copy_from_slice(&self.pool, chunk),
                fragment: (count - i - 1) as u8,
            });
        }
        state.unflushed_bytes += data.len();
    }

    /// Append to the tail segment, then start new segments while capacity
    /// remains. Returns bytes accepted.
    fn enqueue_stream(&self, state: &mut SendQueueState, data: &[u8]) -> usize {
        let mut written = 0;

        if let Some(tail) = state.queue.back_mut() {
            let room = self.mss - tail.data.len();
            let take = room.min(data.len());
            tail.data.extend_from_slice(&data[..take]);
            written += take;
        }

        while written < data.len() && state.queue.len() < self.capacity {
            let take = self.mss.min(data.len() - written);
            let mut segment = PooledBuffer::rent(&self.pool, self.mss);
            segment.extend_from_slice(&data[written..written + take]);
            state.queue.push_back(QueuedSegment {
                data: segment,
                fragment: 0,
            });
            written += take;
        }

        state.unflushed_bytes += written;
        written
    }
}
