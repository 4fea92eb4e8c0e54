use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskCx, Poll};

use futures_util::future::FusedFuture;
use pin_project_lite::pin_project;

use crate::context::Cancelled;
use crate::error::Cause;

pin_project! {
    /// A [`Future`][std::future::Future] for the [`until()`][FutureExt::until()] function.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Until<F> {
        #[pin]
        future: F,
        // Unpin, polled through Pin::new().
        cancelled: Cancelled,
        done: bool,
    }
}

impl<F> Until<F> {
    pub(crate) fn new(future: F, cancelled: Cancelled) -> Self {
        Self {
            future,
            cancelled,
            done: false,
        }
    }

    /// `true` if cancellation was already signalled on the watched
    /// [`Context`][crate::Context].
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}

impl<F> Future for Until<F>
where
    F: Future,
{
    type Output = Result<F::Output, Cause>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if *this.done {
            panic!("Until polled after it returned `Poll::Ready`");
        }

        // Cancellation wins over the wrapped future's readiness.
        if let Poll::Ready(cause) = Pin::new(this.cancelled).poll(cx) {
            *this.done = true;
            return Poll::Ready(Err(cause));
        }

        match this.future.poll(cx) {
            Poll::Ready(output) => {
                *this.done = true;
                Poll::Ready(Ok(output))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F> FusedFuture for Until<F>
where
    F: Future,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<F> Debug for Until<F>
where
    F: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Until")
            .field("future", &self.future)
            .field("cancelled", &self.cancelled)
            .field("done", &self.done)
            .finish()
    }
}

/// A [`Future`][std::future::Future] extension adding the [`.until()`][FutureExt::until()]
/// method, the cooperative-cancellation wrapper for task bodies.
pub trait FutureExt {
    /// Wrap a future to be stopped from resolving once `cancelled` fires,
    /// ie. once the originating [`Context`][crate::Context] or any of its
    /// ancestors is cancelled.
    ///
    /// Yields `Ok()` with the result of the original future, or `Err()` with
    /// the cancellation [`Cause`] if cancellation came first. Cancellation
    /// wins when both are ready at once. There is no `Unpin` requirement on
    /// the wrapped future.
    fn until(self, cancelled: Cancelled) -> Until<Self>
    where
        Self: Sized;
}

impl<F> FutureExt for F
where
    F: Future,
{
    fn until(self, cancelled: Cancelled) -> Until<Self>
    where
        Self: Sized,
    {
        Until::new(self, cancelled)
    }
}
