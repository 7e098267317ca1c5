//! Wake-up signal for the conversation's control loop
//!
//! Two sources wake the loop: a periodic timer (also used as a generic
//! "something changed" poke by the queues) and inbound packets. Timer
//! notifications coalesce into one flag; packets queue up and are handed out
//! one per wait, in arrival order.

use crate::buffer_pool::PooledBuffer;
use crate::error::{KcpError, Result};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A packet handed to the control loop.
///
/// Dropping it returns the buffer to its pool and resolves the caller waiting
/// in `input_packet_async`.
#[derive(Debug)]
pub struct InboundPacket {
    data: PooledBuffer,
    processed: Option<oneshot::Sender<()>>,
}

impl InboundPacket {
    pub fn new(data: PooledBuffer) -> Self {
        Self {
            data,
            processed: None,
        }
    }

    /// Packet plus a receiver that fires once the packet has been processed
    /// or discarded.
    pub fn with_completion(data: PooledBuffer) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                data,
                processed: Some(tx),
            },
            rx,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for InboundPacket {
    fn drop(&mut self) {
        if let Some(tx) = self.processed.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of one [`UpdateActivation::wait`].
///
/// Both fields empty means the activation was disposed.
#[derive(Debug, Default)]
pub struct UpdateNotification {
    pub timer: bool,
    pub packet: Option<InboundPacket>,
}

impl UpdateNotification {
    pub fn is_empty(&self) -> bool {
        !self.timer && self.packet.is_none()
    }
}

#[derive(Debug, Default)]
struct ActivationState {
    timer_pending: bool,
    packets: VecDeque<InboundPacket>,
    waiting: bool,
    disposed: bool,
}

pub struct UpdateActivation {
    state: Mutex<ActivationState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl UpdateActivation {
    /// Create the activation and start its interval timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(period: Duration) -> Arc<Self> {
        let activation = Arc::new(Self {
            state: Mutex::new(ActivationState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let timer = activation.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.shutdown.cancelled() => break,
                    _ = ticker.tick() => timer.notify(),
                }
            }
            trace!("update timer stopped");
        });

        activation
    }

    /// Raise a timer notification. Coalesces with any pending one.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if state.disposed || state.timer_pending {
            return;
        }
        state.timer_pending = true;
        drop(state);
        self.notify.notify_one();
    }

    /// Queue an inbound packet. Returns false (dropping the packet) once
    /// disposed.
    pub fn input_packet(&self, packet: InboundPacket) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            return false;
        }
        state.packets.push_back(packet);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next notification.
    ///
    /// Packets are delivered one per call; a pending timer flag rides along
    /// with the packet. Returns an empty notification once disposed and
    /// [`KcpError::ConcurrentOperation`] if another wait is in progress.
    pub async fn wait(&self) -> Result<UpdateNotification> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Ok(UpdateNotification::default());
            }
            if state.waiting {
                return Err(KcpError::ConcurrentOperation);
            }
            state.waiting = true;
        }
        let _waiting = WaitingGuard(self);

        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.disposed {
                    return Ok(UpdateNotification::default());
                }
                if let Some(packet) = state.packets.pop_front() {
                    let timer = std::mem::take(&mut state.timer_pending);
                    return Ok(UpdateNotification {
                        timer,
                        packet: Some(packet),
                    });
                }
                if std::mem::take(&mut state.timer_pending) {
                    return Ok(UpdateNotification {
                        timer: true,
                        packet: None,
                    });
                }
            }
            notified.await;
        }
    }

    /// Stop the timer, drop queued packets and release any waiter.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.timer_pending = false;
            std::mem::take(&mut state.packets)
        };
        // Release outside the lock: dropping a packet resolves its sender
        drop(dropped);
        self.shutdown.cancel();
        self.notify.notify_one();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

struct WaitingGuard<'a>(&'a UpdateActivation);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().waiting = false;
    }
}
