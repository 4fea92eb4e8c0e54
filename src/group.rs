use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task;

use crate::context::{Canceled, Context};
use crate::error::{Cause, Error, Panicked};
use crate::limiter::Limiter;
use crate::runner::{Runner, TaskRunner};

type CancelHook = Box<dyn FnOnce(Context) -> BoxFuture<'static, ()> + Send>;

/// Internal data shared by [`Group`] clones and its task wrappers.
struct Shared {
    ctx: Context,
    runner: Arc<dyn TaskRunner>,
    /// Arbitrates racing `cancel()` calls. The context alone can't,
    /// as an ancestor may cancel it from outside the group.
    cancel_started: AtomicBool,
    on_cancel: Mutex<Option<CancelHook>>,
    /// Completion signal of the current generation, while one is being watched.
    completion: Mutex<Option<watch::Receiver<bool>>>,
    /// Number of outstanding `Group` clones.
    // NB. We can't use Arc's strong count as task wrappers also hold the Arc.
    num_clones: AtomicU32,
}

impl Shared {
    fn cancel(&self, cause: Option<Cause>) -> bool {
        if self.ctx.is_cancelled() || self.cancel_started.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Launch the hook through the runner before closing it,
        // so that it is tracked like any other task.
        if let Some(hook) = self.on_cancel.lock().take() {
            let _ = self.runner.submit(hook(self.ctx.clone()));
        }

        let cause = cause.unwrap_or_else(|| Arc::new(Canceled) as Cause);
        let first = self.ctx.cancel_with(cause);

        // Outstanding and queued work still completes, only new
        // submissions are turned away.
        let _ = self.runner.close();

        first
    }
}

/// A signal that fires once all work submitted to a [`Group`] so far has
/// completed.
///
/// Obtained with [`Group::completion_signal()`]. Clones observe the same
/// firing.
pub struct CompletionSignal {
    rx: watch::Receiver<bool>,
}

impl CompletionSignal {
    /// Resolves once the signal has fired. Resolves right away if it
    /// already has.
    pub async fn wait(mut self) {
        // The sender is only dropped after firing.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// `true` if the signal already fired.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Clone for CompletionSignal {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Manages a group of tasks sharing one lifecycle: submission, bounded or
/// unbounded concurrency, cancellation with cause, panic supervision and
/// completion signalling.
///
/// `Group` is a cheap cloneable handle; all clones refer to the same group.
/// Dropping the last clone cancels the group as a safety net, but explicit
/// [`close()`][Group::close()] is the intended cleanup path.
///
/// _See [library-level][crate] documentation._
pub struct Group {
    shared: Arc<Shared>,
}

impl Group {
    fn from_parts(ctx: Context, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                runner,
                cancel_started: AtomicBool::new(false),
                on_cancel: Mutex::new(None),
                completion: Mutex::new(None),
                num_clones: AtomicU32::new(1),
            }),
        }
    }

    /// Constructs an empty group with unbounded concurrency and no parent
    /// context.
    ///
    /// Must be used within a tokio runtime.
    pub fn new() -> Self {
        Self::from_parts(Context::background(), Arc::new(Runner::new()))
    }

    /// Constructs an empty group with unbounded concurrency, derived from
    /// `parent`: cancelling `parent` cancels the group and every context
    /// handed to its tasks.
    pub fn with_parent(parent: &Context) -> Self {
        Self::from_parts(parent.child(), Arc::new(Runner::new()))
    }

    /// Constructs an empty group running at most `limit` tasks concurrently;
    /// submissions beyond that are queued in submission order.
    ///
    /// Returns [`Error::InvalidLimit`] if `limit` is zero.
    pub fn limited(limit: usize) -> Result<Self, Error> {
        Ok(Self::from_parts(
            Context::background(),
            Arc::new(Limiter::new(limit)?),
        ))
    }

    /// The limited counterpart of [`with_parent()`][Group::with_parent()].
    pub fn with_parent_limited(parent: &Context, limit: usize) -> Result<Self, Error> {
        Ok(Self::from_parts(parent.child(), Arc::new(Limiter::new(limit)?)))
    }

    /// Submit a task to the group.
    ///
    /// `f` is handed the group's [`Context`] and is expected to observe it
    /// and return once cancelled; nothing terminates it forcibly.
    ///
    /// Returns [`Error::Closed`] once the group is cancelled.
    pub fn submit<F, Fut>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shared.ctx.is_cancelled() {
            return Err(Error::Closed);
        }

        let ctx = self.shared.ctx.clone();
        self.shared.runner.submit(Box::pin(async move { f(ctx).await }))
    }

    /// Submit a supervised task: an error returned by `f`, or a panic
    /// unwinding out of it (captured into [`Panicked`], never crashing the
    /// process), cancels the whole group with that error as the cause.
    ///
    /// Use [`supervised_submit_catch()`][Group::supervised_submit_catch()]
    /// to intercept the error first.
    pub fn supervised_submit<F, Fut, E>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.supervised_submit_catch(f, |_ctx: &Context, cause| Some(cause))
    }

    /// Like [`supervised_submit()`][Group::supervised_submit()], but the
    /// error (or captured panic) is first passed to `catch`, which may
    /// transform it or absorb it entirely: returning `None` suppresses the
    /// group cancellation.
    pub fn supervised_submit_catch<F, Fut, E, C>(&self, f: F, catch: C) -> Result<(), Error>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
        C: FnOnce(&Context, Cause) -> Option<Cause> + Send + 'static,
    {
        if self.shared.ctx.is_cancelled() {
            return Err(Error::Closed);
        }

        let ctx = self.shared.ctx.clone();
        let shared = self.shared.clone();
        let task = async move {
            let result = AssertUnwindSafe(f(ctx.clone())).catch_unwind().await;

            let cause: Option<Cause> = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Arc::new(err)),
                Err(payload) => Some(Arc::new(Panicked::from_payload(payload))),
            };

            if let Some(cause) = cause {
                if let Some(cause) = catch(&ctx, cause) {
                    shared.cancel(Some(cause));
                }
            }
        };

        self.shared.runner.submit(Box::pin(task))
    }

    /// Cancel the group.
    ///
    /// A `None` cause stands for plain graceful shutdown and is replaced by
    /// the [`Canceled`] sentinel. If an [`on_cancel()`][Group::on_cancel()]
    /// hook is configured, it is launched through the group's runner before
    /// the context flips, and completes like any other task. Outstanding and
    /// queued work still completes; only new submissions are turned away.
    ///
    /// Returns `true` if this was the first effective cancellation or
    /// `false` if the group was already cancelled.
    pub fn cancel(&self, cause: Option<Cause>) -> bool {
        self.shared.cancel(cause)
    }

    /// Configure a side effect to be launched (as a tracked task) when the
    /// group is cancelled. Replaces any previously configured hook.
    pub fn on_cancel<H, Fut>(&self, hook: H)
    where
        H: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: CancelHook = Box::new(move |ctx| Box::pin(hook(ctx)) as BoxFuture<'static, ()>);
        *self.shared.on_cancel.lock() = Some(hook);
    }

    /// Resolves once all work submitted so far, including queued work and a
    /// launched cancellation hook, has completed.
    ///
    /// Plain graceful shutdown (no cancellation, or cancellation with the
    /// [`Canceled`] sentinel) yields `Ok(())`; any other cause, such as a
    /// supervised task's error or an ancestor's deadline, is returned
    /// verbatim.
    pub async fn wait(&self) -> Result<(), Cause> {
        self.shared.runner.wait().await;

        match self.shared.ctx.cause() {
            Some(cause) => {
                if cause.downcast_ref::<Canceled>().is_some() {
                    Ok(())
                } else {
                    Err(cause)
                }
            }
            None => Ok(()),
        }
    }

    /// [`cancel()`][Group::cancel()] with no cause, then
    /// [`wait()`][Group::wait()]. Safe to call repeatedly; intended as the
    /// explicit cleanup path.
    pub async fn close(&self) -> Result<(), Cause> {
        self.cancel(None);
        self.wait().await
    }

    /// Dispense a [`CompletionSignal`] that fires once all work submitted so
    /// far has completed.
    ///
    /// On a group with no outstanding work, including a freshly constructed
    /// one, the signal fires promptly. Signals are created lazily per
    /// generation: requesters arriving while a generation's watcher is still
    /// alive share its signal; once it fires and retires, the next request
    /// starts a new generation covering submissions made in the meantime.
    pub fn completion_signal(&self) -> CompletionSignal {
        let mut slot = self.shared.completion.lock();
        if let Some(rx) = &*slot {
            return CompletionSignal { rx: rx.clone() };
        }

        let (tx, rx) = watch::channel(false);
        *slot = Some(rx.clone());

        // Exactly one watcher per generation. Fire first, then retire the
        // generation; requesters racing the retirement observe the fired
        // signal, which is accurate at that instant.
        let shared = self.shared.clone();
        let wait = self.shared.runner.wait();
        task::spawn(async move {
            wait.await;
            let _ = tx.send(true);
            shared.completion.lock().take();
        });

        CompletionSignal { rx }
    }

    /// The group's derived [`Context`], as handed to submitted tasks.
    pub fn context(&self) -> Context {
        self.shared.ctx.clone()
    }

    /// The cancellation cause, if the group (or an ancestor context) was
    /// cancelled.
    pub fn error(&self) -> Option<Cause> {
        self.shared.ctx.cause()
    }

    /// `true` once the group (or an ancestor context) was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.ctx.is_cancelled()
    }

    /// Number of currently executing (not queued) tasks.
    pub fn count(&self) -> usize {
        self.shared.runner.count()
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Group {
    fn clone(&self) -> Self {
        self.shared.num_clones.fetch_add(1, Ordering::SeqCst);

        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if self.shared.num_clones.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last handle gone: cancel cooperatively. This can't wait for
            // the tasks; explicit close() remains the intended cleanup path.
            self.shared.cancel(None);
        }
    }
}

impl Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("count", &self.count())
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.error())
            .finish()
    }
}
