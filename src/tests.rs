use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::FusedFuture;
use futures_util::{future, poll};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::{task, time};

use super::*;
use crate::counter::Counter;

#[derive(Debug)]
struct Boom;

impl Display for Boom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boom")
    }
}

impl StdError for Boom {}

async fn panicking(_ctx: Context) -> Result<(), Boom> {
    panic!("Things aren't going well");
}

async fn yield_to_tokio() {
    for _ in 0..10 {
        task::yield_now().await;
        time::sleep(Duration::from_millis(10)).await;
    }
}

/// A task that holds a concurrency slot until the gate releases it.
fn gated(gate: &Arc<Semaphore>) -> Task {
    let gate = gate.clone();
    Box::pin(async move {
        gate.acquire().await.unwrap().forget();
    })
}

macro_rules! test_st_mt {
    (@ $st_name:ident, $mt_name:ident, $attr:meta, $test:expr) => {
        #[tokio::test(flavor = "current_thread")]
        #[$attr]
        async fn $st_name() {
            $test
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
        #[$attr]
        async fn $mt_name() {
            $test
        }
    };

    ($st_name:ident, $mt_name:ident, $test:expr) => {
        test_st_mt!(@ $st_name, $mt_name, doc(), $test);
    };
}

test_st_mt!(counter_wait_at_zero_st, counter_wait_at_zero_mt, {
    let counter = Counter::new();

    // Nothing counted yet: resolves right away.
    counter.wait().await;

    counter.inc();
    assert_eq!(counter.value(), 1);
    assert_eq!(counter.dec(), 0);
    counter.wait().await;
});

test_st_mt!(counter_no_lost_wakeup_st, counter_no_lost_wakeup_mt, {
    // Waiters started concurrently with the final decrement must all be
    // released; a lost wakeup would hang the test.
    let counter = Arc::new(Counter::new());
    counter.inc();

    let waiters: Vec<_> = (0..10)
        .map(|_| {
            let counter = counter.clone();
            task::spawn(async move { counter.wait().await })
        })
        .collect();

    yield_to_tokio().await;
    counter.dec();

    for waiter in waiters {
        waiter.await.unwrap();
    }
});

test_st_mt!(runner_basic_st, runner_basic_mt, {
    let runner = Runner::new();
    assert_eq!(runner.count(), 0);
    assert!(!runner.is_closed());

    // Idle runner: wait resolves right away.
    runner.wait().await;

    let gate = Arc::new(Semaphore::new(0));
    runner.submit(gated(&gate)).unwrap();
    runner.submit(gated(&gate)).unwrap();

    yield_to_tokio().await;
    assert_eq!(runner.count(), 2);

    let mut wait_ft = Box::pin(runner.wait());
    assert!(poll!(&mut wait_ft).is_pending());

    gate.add_permits(2);
    wait_ft.await;
    assert_eq!(runner.count(), 0);
});

test_st_mt!(runner_close_st, runner_close_mt, {
    let runner = Runner::new();
    let gate = Arc::new(Semaphore::new(0));
    runner.submit(gated(&gate)).unwrap();

    runner.close().unwrap();
    assert!(runner.is_closed());
    assert!(matches!(runner.close(), Err(Error::Closed)));
    assert!(matches!(runner.submit(Box::pin(async {})), Err(Error::Closed)));

    // Close doesn't cancel outstanding work.
    yield_to_tokio().await;
    assert_eq!(runner.count(), 1);

    gate.add_permits(1);
    runner.wait().await;
    // Wait is repeatable after closure and returns promptly.
    runner.wait().await;
    assert_eq!(runner.count(), 0);
});

test_st_mt!(limiter_invalid_limit_st, limiter_invalid_limit_mt, {
    assert!(matches!(Limiter::new(0), Err(Error::InvalidLimit(0))));
});

test_st_mt!(limiter_queues_overflow_st, limiter_queues_overflow_mt, {
    let limiter = Limiter::new(2).unwrap();
    assert_eq!(limiter.capacity(), 2);

    let gate = Arc::new(Semaphore::new(0));
    for _ in 0..5 {
        limiter.submit(gated(&gate)).unwrap();
    }

    yield_to_tokio().await;
    assert_eq!(limiter.count(), 2);
    assert_eq!(limiter.queued_len(), 3);

    gate.add_permits(5);
    limiter.wait().await;
    assert_eq!(limiter.count(), 0);
    assert_eq!(limiter.queued_len(), 0);
});

test_st_mt!(limiter_fifo_st, limiter_fifo_mt, {
    let limiter = Limiter::new(1).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(vec![]));

    for i in 0..4 {
        let gate = gate.clone();
        let order = order.clone();
        limiter
            .submit(Box::pin(async move {
                order.lock().push(i);
                gate.acquire().await.unwrap().forget();
            }))
            .unwrap();
    }

    yield_to_tokio().await;
    assert_eq!(limiter.count(), 1);
    assert_eq!(limiter.queued_len(), 3);

    // Queued tasks start strictly in submission order as slots free up.
    gate.add_permits(4);
    limiter.wait().await;
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
});

test_st_mt!(limiter_close_st, limiter_close_mt, {
    let limiter = Limiter::new(2).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    for _ in 0..3 {
        limiter.submit(gated(&gate)).unwrap();
    }
    yield_to_tokio().await;

    limiter.close().unwrap();
    assert!(limiter.is_closed());
    assert!(matches!(limiter.close(), Err(Error::Closed)));

    // A rejected submission changes neither the count nor the queue.
    assert!(matches!(limiter.submit(Box::pin(async {})), Err(Error::Closed)));
    assert_eq!(limiter.count(), 2);
    assert_eq!(limiter.queued_len(), 1);

    // Already-queued work still runs after close.
    gate.add_permits(3);
    limiter.wait().await;
    limiter.wait().await;
    assert_eq!(limiter.count(), 0);
    assert_eq!(limiter.queued_len(), 0);
});

test_st_mt!(limiter_count_within_limit_st, limiter_count_within_limit_mt, {
    // Submissions racing completions: a freed permit must never be claimed
    // and counted before the completing task's count is gone, so the count
    // can't overshoot the limit even transiently.
    let limiter = Limiter::new(2).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let sampler = {
        let limiter = limiter.clone();
        let done = done.clone();
        task::spawn(async move {
            let mut max = 0;
            while !done.load(Ordering::SeqCst) {
                max = max.max(limiter.count());
                task::yield_now().await;
            }
            max
        })
    };

    for _ in 0..100 {
        limiter
            .submit(Box::pin(async {
                task::yield_now().await;
            }))
            .unwrap();
        task::yield_now().await;
    }

    limiter.wait().await;
    done.store(true, Ordering::SeqCst);
    assert!(sampler.await.unwrap() <= limiter.capacity());
});

test_st_mt!(limiter_idle_close_st, limiter_idle_close_mt, {
    let limiter = Limiter::new(3).unwrap();
    limiter.close().unwrap();
    limiter.wait().await;
});

test_st_mt!(group_limited_concurrency_st, group_limited_concurrency_mt, {
    let group = Group::limited(2).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let running = running.clone();
        let high_water = high_water.clone();
        let done = done.clone();
        group
            .submit(move |_ctx| async move {
                let cur = running.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(cur, Ordering::SeqCst);
                time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    group.wait().await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert!(high_water.load(Ordering::SeqCst) <= 2);
    assert_eq!(group.count(), 0);
});

test_st_mt!(group_reuse_after_drain_st, group_reuse_after_drain_mt, {
    let group = Group::new();

    group.submit(|_ctx| async {}).unwrap();
    group.wait().await.unwrap();

    // Not cancelled: the group accepts new submissions after draining.
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    group
        .submit(move |_ctx| async move { ran2.store(true, Ordering::SeqCst) })
        .unwrap();
    group.wait().await.unwrap();
    assert!(ran.load(Ordering::SeqCst));
});

test_st_mt!(group_cancel_cause_st, group_cancel_cause_mt, {
    let group = Group::new();
    group
        .submit(|ctx| async move {
            let _ = ctx.cancelled().await;
        })
        .unwrap();

    assert!(group.cancel(Some(Arc::new(Boom))));
    // Idempotent: only the first call performs the transition.
    assert!(!group.cancel(None));
    assert!(group.is_cancelled());

    let err = group.wait().await.unwrap_err();
    assert!(err.downcast_ref::<Boom>().is_some());
    assert!(group.error().unwrap().downcast_ref::<Boom>().is_some());

    // Cancellation is terminal: no new submissions.
    assert!(matches!(group.submit(|_| async {}), Err(Error::Closed)));
});

test_st_mt!(group_graceful_cancel_st, group_graceful_cancel_mt, {
    let group = Group::new();
    group
        .submit(|ctx| async move {
            let _ = ctx.cancelled().await;
        })
        .unwrap();

    // A plain cancellation is expected shutdown, not a failure.
    assert!(group.cancel(None));
    group.wait().await.unwrap();
    assert!(group.error().unwrap().downcast_ref::<Canceled>().is_some());
});

test_st_mt!(group_close_repeatedly_st, group_close_repeatedly_mt, {
    let group = Group::new();
    group.submit(|_ctx| async {}).unwrap();

    group.close().await.unwrap();
    group.close().await.unwrap();
    assert!(group.is_cancelled());
});

test_st_mt!(group_parent_cancellation_st, group_parent_cancellation_mt, {
    let parent = Context::background();
    let group = Group::with_parent(&parent);

    let observed = Arc::new(AtomicBool::new(false));
    let observed2 = observed.clone();
    group
        .submit(move |ctx| async move {
            let cause = ctx.cancelled().await;
            if cause.downcast_ref::<Boom>().is_some() {
                observed2.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    yield_to_tokio().await;
    assert!(parent.cancel_with(Arc::new(Boom)));

    // The parent's cause propagates without an explicit group cancel.
    let err = group.wait().await.unwrap_err();
    assert!(err.downcast_ref::<Boom>().is_some());
    assert!(group.is_cancelled());
    assert!(observed.load(Ordering::SeqCst));
    assert!(matches!(group.submit(|_| async {}), Err(Error::Closed)));
});

test_st_mt!(group_parent_deadline_st, group_parent_deadline_mt, {
    let root = Context::background();
    let parent = root.child_with_timeout(Duration::from_millis(50));
    let group = Group::with_parent(&parent);

    group
        .submit(|ctx| async move {
            let _ = ctx.cancelled().await;
        })
        .unwrap();

    let err = group.wait().await.unwrap_err();
    assert!(err.downcast_ref::<DeadlineExceeded>().is_some());
});

test_st_mt!(supervised_error_cancels_group_st, supervised_error_cancels_group_mt, {
    let group = Group::new();
    group
        .supervised_submit(|_ctx| async { Err::<(), _>(Boom) })
        .unwrap();

    let err = group.wait().await.unwrap_err();
    assert!(err.downcast_ref::<Boom>().is_some());
    assert!(group.is_cancelled());
});

test_st_mt!(supervised_catch_absorbs_st, supervised_catch_absorbs_mt, {
    let group = Group::new();
    group
        .supervised_submit_catch(|_ctx| async { Err::<(), _>(Boom) }, |_ctx, _cause| None)
        .unwrap();

    // The absorbed error leaves the group not-cancelled.
    group.wait().await.unwrap();
    assert!(!group.is_cancelled());

    group.submit(|_ctx| async {}).unwrap();
    group.wait().await.unwrap();
});

test_st_mt!(supervised_catch_transforms_st, supervised_catch_transforms_mt, {
    let group = Group::new();
    group
        .supervised_submit_catch(
            |_ctx| async { Err::<(), _>(Boom) },
            |_ctx, _cause| Some(Arc::new(DeadlineExceeded) as Cause),
        )
        .unwrap();

    let err = group.wait().await.unwrap_err();
    assert!(err.downcast_ref::<DeadlineExceeded>().is_some());
});

test_st_mt!(supervised_panic_captured_st, supervised_panic_captured_mt, {
    let group = Group::new();
    group.supervised_submit(panicking).unwrap();

    // The panic never crosses the task boundary; it surfaces as the
    // group's cancellation cause.
    let err = group.wait().await.unwrap_err();
    let panicked = err.downcast_ref::<Panicked>().unwrap();
    assert!(panicked.message().contains("going well"));
});

test_st_mt!(on_cancel_hook_st, on_cancel_hook_mt, {
    let group = Group::new();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    group.on_cancel(move |_ctx| async move {
        fired2.store(true, Ordering::SeqCst);
    });

    group.cancel(None);
    // The hook runs as a tracked task; wait covers it.
    group.wait().await.unwrap();
    assert!(fired.load(Ordering::SeqCst));
});

test_st_mt!(completion_signal_fresh_group_st, completion_signal_fresh_group_mt, {
    let group = Group::new();

    // No outstanding work: the signal fires promptly.
    group.completion_signal().wait().await;
});

test_st_mt!(completion_signal_tracks_work_st, completion_signal_tracks_work_mt, {
    let group = Group::new();
    let gate = Arc::new(Semaphore::new(0));

    let gate2 = gate.clone();
    group
        .submit(move |_ctx| async move {
            gate2.acquire().await.unwrap().forget();
        })
        .unwrap();

    let signal = group.completion_signal();
    assert!(!signal.is_complete());

    // Concurrent requesters observe the same generation.
    let other = group.completion_signal();
    let mut wait_ft = Box::pin(signal.clone().wait());
    assert!(poll!(&mut wait_ft).is_pending());

    gate.add_permits(1);
    wait_ft.await;
    other.wait().await;
    group.wait().await.unwrap();
});

test_st_mt!(completion_signal_generations_st, completion_signal_generations_mt, {
    let group = Group::new();

    group.completion_signal().wait().await;
    // Let the fired generation retire.
    yield_to_tokio().await;

    // A fresh generation covers submissions made in the meantime.
    let gate = Arc::new(Semaphore::new(0));
    let gate2 = gate.clone();
    group
        .submit(move |_ctx| async move {
            gate2.acquire().await.unwrap().forget();
        })
        .unwrap();

    let signal = group.completion_signal();
    assert!(!signal.is_complete());

    gate.add_permits(1);
    signal.wait().await;
});

test_st_mt!(group_clones_share_lifecycle_st, group_clones_share_lifecycle_mt, {
    let group = Group::new();
    let group2 = group.clone();

    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    group2
        .submit(move |_ctx| async move { ran2.store(true, Ordering::SeqCst) })
        .unwrap();
    drop(group2);

    // Dropping a non-last clone doesn't cancel the group.
    assert!(!group.is_cancelled());
    group.wait().await.unwrap();
    assert!(ran.load(Ordering::SeqCst));
});

#[tokio::test]
async fn until_not_cancelled() {
    let ctx = Context::background();
    let mut until = future::ready(42).until(ctx.cancelled());
    let res = (&mut until).await;
    assert!(until.is_terminated()); // FusedFuture impl
    assert!(matches!(res, Ok(42)));
}

#[tokio::test]
async fn until_cancelled() {
    let ctx = Context::background();
    ctx.cancel_with(Arc::new(Boom));
    assert!(ctx.is_cancelled());
    assert!(ctx.cancelled().is_terminated()); // FusedFuture impl

    let res = future::pending::<()>().until(ctx.cancelled()).await;
    assert!(res.unwrap_err().downcast_ref::<Boom>().is_some());
}

#[tokio::test]
async fn until_resolves_on_late_cancel() {
    let ctx = Context::background();
    let mut until_ft = Box::pin(future::pending::<()>().until(ctx.cancelled()));
    assert!(poll!(&mut until_ft).is_pending());

    // The cause surfaces directly in the Err() variant.
    ctx.cancel_with(Arc::new(Boom));
    let cause = until_ft.await.unwrap_err();
    assert!(cause.downcast_ref::<Boom>().is_some());
}

#[tokio::test]
async fn context_chain() {
    let root = Context::background();
    let child = root.child();
    let grandchild = child.child();

    let mut cancelled_ft = Box::pin(grandchild.cancelled());
    assert!(poll!(&mut cancelled_ft).is_pending());

    // Cancelling an intermediate link is visible below it, not above.
    assert!(child.cancel_with(Arc::new(Boom)));
    assert!(!root.is_cancelled());
    assert!(child.is_cancelled());
    assert!(grandchild.is_cancelled());

    let cause = cancelled_ft.await;
    assert!(cause.downcast_ref::<Boom>().is_some());
    assert!(grandchild.cause().unwrap().downcast_ref::<Boom>().is_some());

    // The child's cause is already set; a later cancel is a no-op.
    assert!(!grandchild.cancel_with(Arc::new(DeadlineExceeded)));
    assert!(grandchild.cause().unwrap().downcast_ref::<Boom>().is_some());
}
