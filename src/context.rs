use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskCx, Poll};
use std::time::Duration;

use futures_util::future::FusedFuture;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::Cause;

/// The cause used when a [`Context`] is cancelled without an explicit one.
///
/// [`Group::wait()`][crate::Group::wait()] treats this cause as expected,
/// graceful shutdown rather than a failure.
#[derive(Debug)]
pub struct Canceled;

impl Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The task group was canceled")
    }
}

impl StdError for Canceled {}

/// The cause used by contexts created with
/// [`child_with_timeout()`][Context::child_with_timeout()] once their
/// deadline elapses.
#[derive(Debug)]
pub struct DeadlineExceeded;

impl Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The context deadline was exceeded")
    }
}

impl StdError for DeadlineExceeded {}

/// Internal data shared by [`Context`] and [`Cancelled`] clones.
pub(crate) struct Shared {
    parent: Option<Context>,
    cancelled: AtomicBool,
    /// Set strictly before `cancelled` flips to `true`.
    cause: Mutex<Option<Cause>>,
    notify_cancel: Notify,
}

impl Shared {
    fn new(parent: Option<Context>) -> Self {
        Self {
            parent,
            cancelled: AtomicBool::new(false),
            cause: Mutex::new(None),
            notify_cancel: Notify::new(),
        }
    }
}

/// A cancellation context: a cheap cloneable handle through which a group of
/// tasks observes cancellation and its cause.
///
/// Contexts form a chain: a context derived with [`child()`][Context::child()]
/// is cancelled whenever any of its ancestors is, and reports the ancestor's
/// cause. Cancellation is cooperative; cancelling a context never terminates
/// the tasks observing it, it only resolves their [`Cancelled`] futures.
pub struct Context {
    shared: Pin<Arc<Shared>>,
}

impl Context {
    /// A root context with no parent. Never cancelled unless
    /// [`cancel_with()`][Context::cancel_with()] is called on it.
    pub fn background() -> Self {
        Self {
            shared: Arc::pin(Shared::new(None)),
        }
    }

    /// Derive a child context.
    ///
    /// The child observes cancellation of `self` (and of any ancestor),
    /// while cancelling the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            shared: Arc::pin(Shared::new(Some(self.clone()))),
        }
    }

    /// Derive a child context that cancels itself with the
    /// [`DeadlineExceeded`] cause once `timeout` elapses.
    ///
    /// Must be called within a tokio runtime. The timer only holds a weak
    /// reference; dropping all handles to the child disarms it.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();

        let weak = Arc::downgrade(&Pin::into_inner(child.shared.clone()));
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                let ctx = Context {
                    shared: Pin::new(shared),
                };
                ctx.cancel_with(Arc::new(DeadlineExceeded));
            }
        });

        child
    }

    /// Cancel this context with the given cause.
    ///
    /// This resolves all [`Cancelled`] futures of this context and its
    /// descendants (including ones obtained after this call).
    ///
    /// Returns `true` if this was the first effective cancellation or `false`
    /// if this context (or an ancestor) was already cancelled, in which case
    /// `cause` is discarded.
    pub fn cancel_with(&self, cause: Cause) -> bool {
        if self.is_cancelled() {
            return false;
        }

        {
            // The cause slot arbitrates racing cancel calls.
            let mut slot = self.shared.cause.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
        }

        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify_cancel.notify_waiters();
        true
    }

    /// `true` if this context or any of its ancestors was cancelled.
    pub fn is_cancelled(&self) -> bool {
        let mut ctx = Some(self);
        while let Some(c) = ctx {
            if c.shared.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            ctx = c.shared.parent.as_ref();
        }

        false
    }

    /// The cause of the nearest cancelled context in the chain, starting
    /// from this one, or `None` if not cancelled.
    pub fn cause(&self) -> Option<Cause> {
        let mut ctx = Some(self);
        while let Some(c) = ctx {
            if c.shared.cancelled.load(Ordering::SeqCst) {
                return c.shared.cause.lock().clone();
            }
            ctx = c.shared.parent.as_ref();
        }

        None
    }

    /// Dispense a [`Cancelled`], a future that resolves to the cancellation
    /// cause once this context or any of its ancestors is cancelled.
    ///
    /// The `Cancelled` future can be used with our [`.until()`]
    /// extension to stop `Future`s, with [`.take_until()`] to stop `Stream`s,
    /// as part of `tokio::select!()`, and similar...
    ///
    /// [`.until()`]: crate::FutureExt::until()
    /// [`.take_until()`]: futures_util::stream::StreamExt::take_until()
    pub fn cancelled(&self) -> Cancelled {
        Cancelled::new(self)
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

/// One link of the context chain watched by a [`Cancelled`] future.
struct Link {
    // SAFETY: Drop order matters! `notified` must come before `shared`.
    notified: Pin<Box<Notified<'static>>>,
    shared: Pin<Arc<Shared>>,
}

impl Link {
    fn new(shared: &Pin<Arc<Shared>>) -> Self {
        let notified = shared.notify_cancel.notified();
        // SAFETY: We're keeping a Pin<Arc> to the referenced value until Self is dropped.
        let notified: Notified<'static> = unsafe { mem::transmute(notified) };

        Self {
            notified: Box::pin(notified),
            shared: shared.clone(),
        }
    }

    fn rearm(&mut self) {
        let notified = self.shared.notify_cancel.notified();
        // SAFETY: As in `new()`.
        let notified: Notified<'static> = unsafe { mem::transmute(notified) };
        self.notified = Box::pin(notified);
    }
}

/// A [`Future`] that resolves to the cancellation [`Cause`] once the
/// originating [`Context`] or any of its ancestors is cancelled.
///
/// Obtained with [`Context::cancelled()`].
pub struct Cancelled {
    ctx: Context,
    /// One entry per not-yet-cancelled link of the chain at creation time.
    links: Vec<Link>,
}

impl Cancelled {
    pub(crate) fn new(ctx: &Context) -> Self {
        let mut links = vec![];

        if !ctx.is_cancelled() {
            let mut cur = Some(ctx);
            while let Some(c) = cur {
                links.push(Link::new(&c.shared));
                cur = c.shared.parent.as_ref();
            }
        }

        Self {
            ctx: ctx.clone(),
            links,
        }
    }

    /// `true` if cancellation was already signalled.
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }
}

impl Future for Cancelled {
    type Output = Cause;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<Self::Output> {
        // All fields are Unpin.
        let this = self.get_mut();

        if let Some(cause) = this.ctx.cause() {
            return Poll::Ready(cause);
        }

        for link in &mut this.links {
            loop {
                match link.notified.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        // The Notify is only ever notified on cancellation,
                        // but re-arm and re-check rather than assume.
                        if let Some(cause) = this.ctx.cause() {
                            return Poll::Ready(cause);
                        }
                        link.rearm();
                    }
                    Poll::Pending => break,
                }
            }
        }

        Poll::Pending
    }
}

impl FusedFuture for Cancelled {
    fn is_terminated(&self) -> bool {
        self.is_cancelled()
    }
}

impl Clone for Cancelled {
    fn clone(&self) -> Self {
        Self::new(&self.ctx)
    }
}

impl Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
