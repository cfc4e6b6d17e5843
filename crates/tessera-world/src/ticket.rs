//! Completion handles for store operations.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::StoreError;

/// Identifies the holder of a [`Ticket`] so it can be withdrawn from a pending load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId(pub(crate) u64);

/// Handle to the eventual result of a store operation.
///
/// Never blocks unless asked to: the simulation thread polls with
/// [`Ticket::try_get`] once per tick. A ticket whose operation was dropped
/// without completing resolves to [`StoreError::Cancelled`].
#[derive(Debug)]
pub struct Ticket<T> {
    waiter: WaiterId,
    rx: Receiver<Result<T, StoreError>>,
    result: Option<Result<T, StoreError>>,
}

/// Producer side of a [`Ticket`].
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: Sender<Result<T, StoreError>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T, StoreError>) {
        // The ticket may have been dropped; nobody is waiting then.
        let _ = self.tx.send(result);
    }
}

impl<T> Ticket<T> {
    /// Create an unresolved ticket and its completer.
    pub(crate) fn pending(waiter: WaiterId) -> (Completer<T>, Self) {
        let (tx, rx) = channel::bounded(1);
        (
            Completer { tx },
            Self {
                waiter,
                rx,
                result: None,
            },
        )
    }

    /// Create a ticket that is already resolved.
    pub(crate) fn resolved(waiter: WaiterId, result: Result<T, StoreError>) -> Self {
        Self {
            waiter,
            rx: channel::never(),
            result: Some(result),
        }
    }

    /// Waiter identity for [`ChunkStore::cancel`](crate::ChunkStore::cancel).
    pub fn waiter(&self) -> WaiterId {
        self.waiter
    }

    fn poll(&mut self) {
        if self.result.is_some() {
            return;
        }
        match self.rx.try_recv() {
            Ok(result) => self.result = Some(result),
            Err(TryRecvError::Disconnected) => self.result = Some(Err(StoreError::Cancelled)),
            Err(TryRecvError::Empty) => {}
        }
    }

    /// Check whether the result has arrived.
    pub fn is_ready(&mut self) -> bool {
        self.poll();
        self.result.is_some()
    }

    /// Borrow the result if it has arrived.
    pub fn try_get(&mut self) -> Option<&Result<T, StoreError>> {
        self.poll();
        self.result.as_ref()
    }

    /// Block until the result arrives.
    pub fn wait(mut self) -> Result<T, StoreError> {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.rx.recv().unwrap_or(Err(StoreError::Cancelled))
    }

    /// Block for at most `timeout`. Returns `None` if the result is still pending.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<&Result<T, StoreError>> {
        if self.result.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(result) => self.result = Some(result),
                Err(RecvTimeoutError::Disconnected) => self.result = Some(Err(StoreError::Cancelled)),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.result.as_ref()
    }

    /// Take the result if it has arrived, leaving the ticket empty.
    pub fn take(&mut self) -> Option<Result<T, StoreError>> {
        self.poll();
        let result = self.result.take();
        if result.is_some() {
            self.rx = channel::never();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_once_completed() {
        let (completer, mut ticket) = Ticket::<u32>::pending(WaiterId(1));
        assert!(!ticket.is_ready());
        assert!(ticket.try_get().is_none());

        completer.complete(Ok(7));
        assert_eq!(ticket.try_get(), Some(&Ok(7)));
        assert_eq!(ticket.wait(), Ok(7));
    }

    #[test]
    fn dropped_completer_means_cancelled() {
        let (completer, mut ticket) = Ticket::<()>::pending(WaiterId(2));
        drop(completer);
        assert_eq!(ticket.try_get(), Some(&Err(StoreError::Cancelled)));
    }

    #[test]
    fn wait_blocks_until_another_thread_completes() {
        let (completer, ticket) = Ticket::<String>::pending(WaiterId(3));
        let worker = thread::spawn(move || completer.complete(Ok("done".to_string())));
        assert_eq!(ticket.wait(), Ok("done".to_string()));
        worker.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let (_completer, mut ticket) = Ticket::<u8>::pending(WaiterId(4));
        assert!(ticket.wait_timeout(Duration::from_millis(5)).is_none());
        let mut ready = Ticket::resolved(WaiterId(5), Ok(1u8));
        assert_eq!(ready.wait_timeout(Duration::ZERO), Some(&Ok(1)));
        assert_eq!(ready.take(), Some(Ok(1)));
        assert!(ready.take().is_none());
    }
}
