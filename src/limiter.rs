use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task;

use crate::counter::Counter;
use crate::error::Error;
use crate::runner::{Task, TaskRunner};

/// Permit and queue bookkeeping, all guarded by one mutex.
///
/// The mutex is only ever taken for the two admission decisions,
/// "claim-or-enqueue" on submit and "dequeue-and-transfer-or-release" on
/// completion; user tasks never run under it.
struct State {
    /// Permits currently in the pool. While the limiter is open,
    /// permits outstanding + `free` == limit.
    free: usize,
    /// Deferred submissions, in submission order.
    pending: VecDeque<Task>,
    closed: bool,
}

/// Internal data shared by [`Limiter`] clones and its task wrappers.
struct Shared {
    counter: Counter,
    limit: usize,
    state: Mutex<State>,
}

impl Shared {
    fn new(limit: usize) -> Self {
        Self {
            counter: Counter::new(),
            limit,
            state: Mutex::new(State {
                free: limit,
                pending: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Start `task` on an already-claimed permit, with its count already
    /// incremented.
    fn run(shared: &Arc<Shared>, task: Task) {
        let completion = Completion {
            shared: shared.clone(),
        };
        task::spawn(async move {
            let _completion = completion;
            task.await;
        });
    }
}

/// Completion bookkeeping for one running task; runs on drop so that a panic
/// unwinding out of the task still hands its permit on.
///
/// If work is pending, the head of the queue is started on this task's
/// permit; the permit never travels through the pool while work is waiting
/// for it. The successor's increment happens before our decrement, so the
/// counter can't touch zero while work remains.
struct Completion {
    shared: Arc<Shared>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let (next, finalize) = {
            let mut state = self.shared.state.lock();
            let next = state.pending.pop_front();

            if next.is_some() {
                self.shared.counter.inc();
            } else if !state.closed {
                state.free += 1;
            }

            // Decrement under the lock, like submit's increment: a released
            // permit can't be claimed and counted before our count is gone,
            // so the count never overshoots the limit.
            let finalize = self.shared.counter.dec() == 0 && state.closed;
            (next, finalize)
        };

        if let Some(next) = next {
            Shared::run(&self.shared, next);
        }

        if finalize {
            self.shared.counter.close();
        }
    }
}

/// The bounded task runner: at most `limit` submissions execute at any
/// instant; submissions beyond that are queued and started strictly in
/// submission order as running tasks complete.
///
/// [`submit()`][TaskRunner::submit()] never blocks; a submission that can't
/// claim a permit right away is enqueued. A queued task always runs on a
/// permit handed over by a completing task, never on a freshly issued one.
///
/// `Limiter` is a cheap cloneable handle; all clones refer to the same
/// task set.
pub struct Limiter {
    shared: Arc<Shared>,
}

impl Limiter {
    /// Constructs an empty limiter admitting at most `limit` concurrently
    /// running tasks.
    ///
    /// Returns [`Error::InvalidLimit`] if `limit` is zero.
    /// Must be used within a tokio runtime.
    pub fn new(limit: usize) -> Result<Self, Error> {
        if limit == 0 {
            return Err(Error::InvalidLimit(limit));
        }

        Ok(Self {
            shared: Arc::new(Shared::new(limit)),
        })
    }

    /// The configured concurrency limit.
    pub fn capacity(&self) -> usize {
        self.shared.limit
    }

    /// Number of submissions currently queued, ie. accepted but not yet
    /// running.
    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl TaskRunner for Limiter {
    fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn submit(&self, task: Task) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        // Claim a permit only if no one is queued ahead of us,
        // otherwise they would be starved.
        if state.free > 0 && state.pending.is_empty() {
            state.free -= 1;
            self.shared.counter.inc();
            drop(state);
            Shared::run(&self.shared, task);
        } else {
            state.pending.push_back(task);
        }

        Ok(())
    }

    fn count(&self) -> usize {
        self.shared.counter.value() as usize
    }

    fn wait(&self) -> BoxFuture<'static, ()> {
        let shared = self.shared.clone();
        Box::pin(async move { shared.counter.wait().await })
    }

    fn close(&self) -> Result<(), Error> {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            state.closed = true;

            // Already-queued work still runs; only new submissions are
            // turned away.
            state.pending.is_empty() && self.shared.counter.value() == 0
        };

        if idle {
            self.shared.counter.close();
        }

        Ok(())
    }
}

impl Clone for Limiter {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .field("queued", &self.queued_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
