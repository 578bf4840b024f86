//! Continuations
//!
//! A continuation is a one-shot suspension point that something outside the
//! runtime resumes: a callback-based API, another thread, a timer. The
//! awaiting side holds a [`ContinuationFuture`]; the resuming side holds the
//! matching [`Continuation`] and calls [`Continuation::resume`] exactly once.
//! Dropping a continuation without resuming it resolves the awaiter with an
//! error instead of leaving it suspended forever.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::runtime::error::{TaskError, TaskResult};

struct Shared<T> {
    value: Option<TaskResult<T>>,
    waker: Option<Waker>,
    resumed: bool,
}

/// The resuming half.
pub struct Continuation<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

/// The awaiting half.
#[must_use = "futures do nothing unless awaited"]
pub struct ContinuationFuture<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

/// Create a connected continuation pair.
pub fn continuation<T>() -> (Continuation<T>, ContinuationFuture<T>) {
    let shared = Arc::new(Mutex::new(Shared {
        value: None,
        waker: None,
        resumed: false,
    }));
    (
        Continuation {
            shared: shared.clone(),
        },
        ContinuationFuture { shared },
    )
}

/// Hand a fresh continuation to `start` and wait for it to be resumed.
pub fn with_continuation<T, F>(start: F) -> ContinuationFuture<T>
where
    F: FnOnce(Continuation<T>),
{
    let (continuation, future) = continuation();
    start(continuation);
    future
}

impl<T> Continuation<T> {
    /// Resume the awaiter with a value.
    pub fn resume(
        self,
        value: T,
    ) {
        self.complete(Ok(value));
    }

    /// Resume the awaiter with an error.
    pub fn resume_with_error(
        self,
        error: TaskError,
    ) {
        self.complete(Err(error));
    }

    /// Resume with an already built outcome.
    pub fn resume_with(
        self,
        result: TaskResult<T>,
    ) {
        self.complete(result);
    }

    fn complete(
        &self,
        result: TaskResult<T>,
    ) {
        let waker = {
            let mut shared = self.shared.lock();
            if shared.resumed {
                return;
            }
            shared.resumed = true;
            shared.value = Some(result);
            shared.waker.take()
        };
        trace!("continuation resumed");
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        if self.shared.lock().resumed {
            return;
        }
        warn!("continuation dropped without being resumed");
        self.complete(Err(TaskError::msg("continuation dropped without being resumed")));
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("resumed", &self.shared.lock().resumed)
            .finish()
    }
}

impl<T> Future for ContinuationFuture<T> {
    type Output = TaskResult<T>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<TaskResult<T>> {
        let mut shared = self.shared.lock();
        if let Some(value) = shared.value.take() {
            return Poll::Ready(value);
        }
        if shared.resumed {
            return Poll::Ready(Err(TaskError::Consumed));
        }
        match &shared.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => shared.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for ContinuationFuture<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("ContinuationFuture")
            .field("resumed", &shared.resumed)
            .field("ready", &shared.value.is_some())
            .finish()
    }
}

/// Give other jobs on the executor a chance to run.
///
/// The task is re-enqueued right away and resumes on its next turn.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
