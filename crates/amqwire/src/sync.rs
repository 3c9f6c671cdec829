//! Wakeup primitives tying the reader task to waiting callers.
//!
//! Replies and polled get-results are ordered queues: the reader pushes,
//! exactly one caller at a time pops, and closing the connection releases
//! every waiter. `tokio::sync::Notify` provides the wakeups; registering
//! interest before re-checking state keeps the hand-off lossless.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use amqwire_proto::{Method, ProtocolError};
use tokio::sync::Notify;

use crate::error::Error;

/// An unbounded FIFO that waiters can block on, closable from either side.
///
/// `pop` returns `None` once the mailbox is closed and drained.
pub(crate) struct Mailbox<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_waiters();
    }

    /// Wake all waiters and make future `pop`s return `None` once the
    /// queued items run out.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            // Register interest before checking state so a push or close
            // racing with the check still wakes us.
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().unwrap().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

/// The per-entity ordered reply queue.
///
/// Synchronous methods are answered strictly in the order they were sent,
/// so correlation is positional: the caller that sent the n-th expecting
/// method pops the n-th reply. Callers hold the write path exclusively
/// while their method is in flight, which keeps the ordering invariant.
pub(crate) struct ReplyCorrelator {
    replies: Mailbox<Result<Method, ProtocolError>>,
}

impl ReplyCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            replies: Mailbox::new(),
        }
    }

    pub(crate) fn deliver(&self, reply: Result<Method, ProtocolError>) {
        self.replies.push(reply);
    }

    /// Release every waiter; they observe a dead connection.
    pub(crate) fn abort(&self) {
        self.replies.close();
    }

    pub(crate) async fn recv(&self) -> Result<Method, Error> {
        match self.replies.pop().await {
            Some(Ok(method)) => Ok(method),
            Some(Err(err)) => Err(Error::Protocol(err)),
            None => Err(Error::ConnectionAborted),
        }
    }
}

/// Level-triggered signal for "the unconfirmed set may have changed".
///
/// Waiters re-check the live count after each wakeup rather than trusting
/// the edge, so an ack that lands between the check and the await is never
/// lost.
pub(crate) struct ConfirmSignal {
    notify: Notify,
    aborted: AtomicBool,
}

impl ConfirmSignal {
    pub(crate) fn new() -> Self {
        Self {
            notify: Notify::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn settled(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn pop_returns_queued_items_in_order() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.push(2);
        assert_eq!(mailbox.pop().await, Some(1));
        assert_eq!(mailbox.pop().await, Some(2));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push("late");
        assert_eq!(waiter.await.unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn close_releases_waiters_with_none() {
        let mailbox: Arc<Mailbox<u8>> = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_drains_queued_items_first() {
        let mailbox = Mailbox::new();
        mailbox.push(7);
        mailbox.close();
        assert_eq!(mailbox.pop().await, Some(7));
        assert_eq!(mailbox.pop().await, None);
    }

    #[tokio::test]
    async fn correlator_maps_broker_errors() {
        let correlator = ReplyCorrelator::new();
        correlator.deliver(Err(ProtocolError::new(406, "PRECONDITION_FAILED")));
        match correlator.recv().await {
            Err(Error::Protocol(err)) => assert_eq!(err.code, 406),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn correlator_abort_reports_dead_connection() {
        let correlator = ReplyCorrelator::new();
        correlator.abort();
        assert!(matches!(
            correlator.recv().await,
            Err(Error::ConnectionAborted)
        ));
    }
}
