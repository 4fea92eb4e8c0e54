use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

/// The counting primitive shared by both runner kinds.
///
/// A plain atomic counter extended with two things: waiters can block until
/// the value returns to zero, and the counter can be terminally closed,
/// which releases all current and future waiters regardless of the value.
///
/// The zero-wait is race-free against concurrent increments by construction:
/// a waiter registers with the wakeup source *before* it inspects the value,
/// so a wait started concurrently with the first increment can never miss
/// the wakeup of the matching decrement.
pub(crate) struct Counter {
    value: AtomicU64,
    closed: AtomicBool,
    notify_zero: Notify,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify_zero: Notify::new(),
        }
    }

    /// Increment, returning the new value.
    pub(crate) fn inc(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement, returning the new value. Waiters are released when
    /// the value reaches zero.
    ///
    /// Panics if the value is already zero; every decrement must pair
    /// with a previous increment.
    pub(crate) fn dec(&self) -> u64 {
        let prev = self.value.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "Counter decremented below zero");

        let new = prev - 1;
        if new == 0 {
            self.notify_zero.notify_waiters();
        }

        new
    }

    /// Snapshot of the current value.
    pub(crate) fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminally close the counter, releasing all current and future
    /// waiters. Idempotent.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify_zero.notify_waiters();
        }
    }

    /// Resolves once the value is zero or the counter is closed.
    ///
    /// If the value is already zero, resolves right away.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify_zero.notified();
            tokio::pin!(notified);

            // Register with the Notify before checking the value, otherwise
            // a notify_waiters() between the check and the await is lost.
            notified.as_mut().enable();

            if self.value() == 0 || self.is_closed() {
                return;
            }

            notified.await;
        }
    }
}
