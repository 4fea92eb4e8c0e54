use std::fmt::{self, Debug};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task;

use crate::counter::Counter;
use crate::error::Error;

/// A unit of work accepted by a [`TaskRunner`].
pub type Task = BoxFuture<'static, ()>;

/// The contract shared by both runner kinds, [`Runner`] and
/// [`Limiter`][crate::Limiter].
///
/// A task runner tracks a set of concurrently executing tasks through one
/// shared counter: every accepted submission is guaranteed exactly one
/// matching completion, so [`wait()`][TaskRunner::wait()] can neither hang on
/// a phantom count nor return while accepted work remains.
pub trait TaskRunner: Send + Sync + 'static {
    /// `true` once [`close()`][TaskRunner::close()] was called.
    fn is_closed(&self) -> bool;

    /// Submit a task for execution.
    ///
    /// Returns without waiting for the task; whether it starts right away is
    /// up to the runner kind. Returns [`Error::Closed`] after
    /// [`close()`][TaskRunner::close()], in which case the task is dropped
    /// unexecuted.
    fn submit(&self, task: Task) -> Result<(), Error>;

    /// Number of currently executing (not queued) tasks.
    fn count(&self) -> usize;

    /// Resolves once the count has returned to zero for all work submitted
    /// so far, including queued work.
    ///
    /// May be called any number of times, also after closing.
    fn wait(&self) -> BoxFuture<'static, ()>;

    /// Close the runner to new submissions.
    ///
    /// Outstanding and queued work is not cancelled and still completes;
    /// [`wait()`][TaskRunner::wait()] still observes that completion.
    /// A second call returns [`Error::Closed`].
    fn close(&self) -> Result<(), Error>;
}

/// Internal data shared by [`Runner`] clones and its task wrappers.
struct Shared {
    counter: Counter,
    /// Guards the submit/close decision so that a submission never races
    /// the "close with nothing running" counter finalisation.
    closed: Mutex<bool>,
}

impl Shared {
    fn new() -> Self {
        Self {
            counter: Counter::new(),
            closed: Mutex::new(false),
        }
    }
}

/// Completion bookkeeping for one running task.
///
/// Runs on drop so that a panic unwinding out of the task still releases
/// its count.
struct Completion {
    shared: Arc<Shared>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.shared.counter.dec() == 0 && *self.shared.closed.lock() {
            self.shared.counter.close();
        }
    }
}

/// The unbounded task runner: every submission starts executing right away
/// on a freshly spawned tokio task.
///
/// `Runner` is a cheap cloneable handle; all clones refer to the same
/// task set.
pub struct Runner {
    shared: Arc<Shared>,
}

impl Runner {
    /// Constructs an empty runner.
    ///
    /// Must be used within a tokio runtime.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }
}

impl TaskRunner for Runner {
    fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }

    fn submit(&self, task: Task) -> Result<(), Error> {
        {
            let closed = self.shared.closed.lock();
            if *closed {
                return Err(Error::Closed);
            }

            // Increment under the lock: a concurrent close() either sees the
            // count or we see the closed flag, never neither.
            self.shared.counter.inc();
        }

        let completion = Completion {
            shared: self.shared.clone(),
        };
        task::spawn(async move {
            let _completion = completion;
            task.await;
        });

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
        let mut closed = self.shared.closed.lock();
        if *closed {
            return Err(Error::Closed);
        }
        *closed = true;

        // Nothing running: finalise right away, releasing all waiters.
        // Otherwise the last Completion does it.
        if self.shared.counter.value() == 0 {
            self.shared.counter.close();
        }

        Ok(())
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Runner {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("count", &self.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
