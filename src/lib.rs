//! Task groups for Tokio with bounded concurrency, cancellation with cause
//! and completion signalling.
//!
//! This is a small library intended to help with worker pools, fan-out/fan-in
//! pipelines and graceful shutdown in programs with a number of cooperating
//! tasks sharing one lifecycle.
//!
//! ## Usage
//!
//! The library's entry point is the [`Group`] type, which represents a group
//! of tasks.
//!
//! #### Creating a group
//!
//! [`Group::new()`] creates a group with unbounded concurrency: every
//! submission starts executing right away. [`Group::limited()`] creates a
//! group running at most `limit` tasks at any instant; submissions beyond
//! that are queued and started strictly in submission order as running tasks
//! complete, without ever blocking the submitter.
//!
//! The [`with_parent()`][Group::with_parent()] variants derive the group's
//! [`Context`] from a parent one: cancelling the parent (for example through
//! a [`child_with_timeout()`][Context::child_with_timeout()] deadline)
//! cancels the group and every context handed to its tasks.
//!
//! The `Group` may be cloned freely; all clones refer to the same group.
//!
//! #### Submitting tasks
//!
//! Tasks are added with [`submit()`][Group::submit()], which hands the task
//! the group's `Context`. Cancellation is cooperative: a task is expected to
//! observe the context, typically via the [`.until()`][FutureExt::until()]
//! extension or `tokio::select!` over [`Context::cancelled()`], and return.
//! Nothing terminates a running task forcibly.
//!
//! [`supervised_submit()`][Group::supervised_submit()] adds supervision: an
//! error returned by the task, or a panic unwinding out of it (captured into
//! the [`Panicked`] error, never crashing the process), cancels the whole
//! group with that error as the cause. An optional `catch` handler
//! ([`supervised_submit_catch()`][Group::supervised_submit_catch()]) may
//! transform or absorb the error first.
//!
//! #### Cancelling and waiting
//!
//! [`cancel()`][Group::cancel()] cancels the group with an optional cause;
//! outstanding and queued work still completes, only new submissions are
//! turned away. [`wait().await`][Group::wait()] resolves once all work
//! submitted so far has completed and reports the cancellation cause, with
//! plain graceful shutdown ([`Canceled`]) translated to `Ok(())`.
//! [`close()`][Group::close()] combines the two for scoped cleanup.
//!
//! For fan-in without holding the group, [`completion_signal()`][Group::completion_signal()]
//! dispenses a cloneable [`CompletionSignal`] that fires once all currently
//! submitted work has drained.
//!
//! ## Example
//!
//! A bounded worker pool with graceful shutdown:
//!
//! ```rust
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! #
//! # use eyre::Result;
//! # use tokio::time;
//! # use tokio_workgroup::{FutureExt as _, Group};
//! #
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // At most two tasks run at once, the rest are queued.
//!     let group = Group::limited(2)?;
//!     let done = Arc::new(AtomicUsize::new(0));
//!
//!     for _ in 0..6 {
//!         let done = done.clone();
//!         group.submit(move |ctx| async move {
//!             // Stop waiting early if the group is cancelled.
//!             let _ = time::sleep(Duration::from_millis(50)).until(ctx.cancelled()).await;
//!             done.fetch_add(1, Ordering::SeqCst);
//!         })?;
//!     }
//!
//!     // Resolves once all six tasks have completed.
//!     group.wait().await?;
//!     assert_eq!(done.load(Ordering::SeqCst), 6);
//!
//!     Ok(())
//! }
//! ```
//!
//! There is also an example worker pool with signal-driven shutdown in
//! `demos/shutdown.rs`.

mod context;
mod counter;
mod error;
mod future_ext;
mod group;
mod limiter;
mod runner;

pub use crate::context::{Canceled, Cancelled, Context, DeadlineExceeded};
pub use crate::error::{Cause, Error, Panicked};
pub use crate::future_ext::{FutureExt, Until};
pub use crate::group::{CompletionSignal, Group};
pub use crate::limiter::Limiter;
pub use crate::runner::{Runner, Task, TaskRunner};

#[cfg(test)]
mod tests;
