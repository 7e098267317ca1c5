//! Single pending-operation slot shared by the send and receive queues
//!
//! Each queue side allows one outstanding async operation. The slot records
//! which operation owns it and whether it was cancelled; the waiting future
//! polls its condition under the queue lock and parks on a `Notify` between
//! checks.

use crate::error::{CancelCause, KcpError, Result};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub(crate) struct PendingSlot {
    current: Option<PendingOperation>,
    next_id: u64,
}

#[derive(Debug)]
struct PendingOperation {
    id: u64,
    cancellation: Option<Option<CancelCause>>,
}

impl PendingSlot {
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Fail with [`KcpError::ConcurrentOperation`] if an operation is pending.
    pub fn ensure_idle(&self) -> Result<()> {
        if self.is_active() {
            Err(KcpError::ConcurrentOperation)
        } else {
            Ok(())
        }
    }

    fn begin(&mut self) -> Result<u64> {
        self.ensure_idle()?;
        self.next_id = self.next_id.wrapping_add(1);
        self.current = Some(PendingOperation {
            id: self.next_id,
            cancellation: None,
        });
        Ok(self.next_id)
    }

    fn end(&mut self, id: u64) {
        if self.current.as_ref().is_some_and(|op| op.id == id) {
            self.current = None;
        }
    }

    /// Mark the pending operation cancelled. Returns false if there is none.
    pub fn cancel(&mut self, cause: Option<CancelCause>) -> bool {
        match self.current.as_mut() {
            Some(op) if op.cancellation.is_none() => {
                op.cancellation = Some(cause);
                true
            }
            _ => false,
        }
    }

    fn take_cancellation(&mut self, id: u64) -> Option<Option<CancelCause>> {
        self.current
            .as_mut()
            .filter(|op| op.id == id)
            .and_then(|op| op.cancellation.take())
    }
}

/// Queue state that owns a [`PendingSlot`].
pub(crate) trait HasPendingSlot {
    fn pending(&mut self) -> &mut PendingSlot;
}

/// Occupies the slot for the lifetime of one async operation.
///
/// Dropping the guard (operation finished, failed, or its future was dropped)
/// frees the slot.
pub(crate) struct OperationGuard<'a, S: HasPendingSlot> {
    state: &'a Mutex<S>,
    id: u64,
}

impl<'a, S: HasPendingSlot> OperationGuard<'a, S> {
    pub fn begin(state: &'a Mutex<S>) -> Result<Self> {
        let id = state.lock().pending().begin()?;
        Ok(Self { state, id })
    }

    /// Poll `check` under the lock until it yields a result.
    ///
    /// An explicit cancellation always wins over the condition. A fired
    /// `cancel` token resolves the wait with a cause-less cancellation.
    pub async fn wait<R>(
        &self,
        notify: &Notify,
        cancel: Option<&CancellationToken>,
        mut check: impl FnMut(&mut S) -> Option<Result<R>>,
    ) -> Result<R> {
        loop {
            let notified = notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(cause) = state.pending().take_cancellation(self.id) {
                    return Err(KcpError::cancelled(cause));
                }
                if let Some(result) = check(&mut state) {
                    return result;
                }
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = token.cancelled() => return Err(KcpError::cancelled(None)),
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl<S: HasPendingSlot> Drop for OperationGuard<'_, S> {
    fn drop(&mut self) {
        self.state.lock().pending().end(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct State {
        slot: PendingSlot,
        ready: bool,
    }

    impl HasPendingSlot for State {
        fn pending(&mut self) -> &mut PendingSlot {
            &mut self.slot
        }
    }

    #[test]
    fn test_second_operation_rejected() {
        let state = Mutex::new(State::default());
        let guard = OperationGuard::begin(&state).unwrap();
        assert!(matches!(
            OperationGuard::begin(&state),
            Err(KcpError::ConcurrentOperation)
        ));
        drop(guard);
        assert!(OperationGuard::begin(&state).is_ok());
    }

    #[tokio::test]
    async fn test_wait_completes_on_condition() {
        let state = Arc::new(Mutex::new(State::default()));
        let notify = Arc::new(Notify::new());

        let waiter = {
            let state = state.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                let guard = OperationGuard::begin(&state).unwrap();
                guard
                    .wait(&notify, None, |s| s.ready.then_some(Ok(42)))
                    .await
            })
        };

        tokio::task::yield_now().await;
        state.lock().ready = true;
        notify.notify_one();

        assert_eq!(waiter.await.unwrap().unwrap(), 42);
        assert!(!state.lock().slot.is_active());
    }

    #[tokio::test]
    async fn test_explicit_cancel_carries_cause() {
        let state = Mutex::new(State::default());
        let notify = Notify::new();
        let guard = OperationGuard::begin(&state).unwrap();

        let cause: CancelCause = Arc::new(std::io::Error::other("stop"));
        assert!(state.lock().slot.cancel(Some(cause)));
        notify.notify_one();

        let err = guard
            .wait(&notify, None, |_| None::<Result<()>>)
            .await
            .unwrap_err();
        match err {
            KcpError::Cancelled { cause: Some(c) } => assert_eq!(c.to_string(), "stop"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_cancels() {
        let state = Mutex::new(State::default());
        let notify = Notify::new();
        let token = CancellationToken::new();
        token.cancel();

        let guard = OperationGuard::begin(&state).unwrap();
        let err = guard
            .wait(&notify, Some(&token), |_| None::<Result<()>>)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
