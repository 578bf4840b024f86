//! Sleeping and timeouts
//!
//! One lazily started timer thread keeps a min-heap of deadlines and wakes
//! the tasks whose deadline passed. Waking goes through the ordinary task
//! waker, so a sleeping task resumes on whatever executor it prefers.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

use crate::runtime::error::{fatal, FatalError};

/// A timer registration shared between a [`Sleep`] and the timer thread.
#[derive(Default)]
struct Registration {
    waker: Mutex<Option<Waker>>,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    registration: Arc<Registration>,
}

impl PartialEq for Entry {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(
        &self,
        other: &Self,
    ) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct Timer {
    entries: Mutex<BinaryHeap<Reverse<Entry>>>,
    changed: Condvar,
    seq: AtomicU64,
}

static TIMER: Lazy<Arc<Timer>> = Lazy::new(|| {
    let timer = Arc::new(Timer {
        entries: Mutex::new(BinaryHeap::new()),
        changed: Condvar::new(),
        seq: AtomicU64::new(0),
    });
    let worker = timer.clone();
    let spawned = thread::Builder::new()
        .name("weft-timer".to_string())
        .spawn(move || worker.run());
    if let Err(error) = spawned {
        fatal(FatalError::InvalidState(format!(
            "failed to spawn timer thread: {}",
            error
        )));
    }
    timer
});

impl Timer {
    fn register(
        &self,
        deadline: Instant,
        registration: Arc<Registration>,
    ) {
        let entry = Entry {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            registration,
        };
        let mut entries = self.entries.lock();
        let earliest = entries
            .peek()
            .is_none_or(|Reverse(top)| deadline < top.deadline);
        entries.push(Reverse(entry));
        drop(entries);
        if earliest {
            self.changed.notify_one();
        }
    }

    fn run(&self) {
        let mut expired = Vec::new();
        let mut entries = self.entries.lock();
        loop {
            let now = Instant::now();
            while entries
                .peek()
                .is_some_and(|Reverse(top)| top.deadline <= now)
            {
                if let Some(Reverse(entry)) = entries.pop() {
                    expired.push(entry.registration);
                }
            }

            if !expired.is_empty() {
                drop(entries);
                trace!(count = expired.len(), "timers fired");
                for registration in expired.drain(..) {
                    let waker = registration.waker.lock().take();
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
                entries = self.entries.lock();
                continue;
            }

            match entries.peek().map(|Reverse(top)| top.deadline) {
                Some(deadline) => {
                    self.changed.wait_until(&mut entries, deadline);
                }
                None => self.changed.wait(&mut entries),
            }
        }
    }
}

/// Suspend the current task for `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Suspend the current task until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        registration: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    deadline: Instant,
    registration: Option<Arc<Registration>>,
}

impl Sleep {
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[inline]
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let this = self.get_mut();
        if this.is_elapsed() {
            return Poll::Ready(());
        }
        match &this.registration {
            Some(registration) => {
                let mut waker = registration.waker.lock();
                match waker.as_ref() {
                    Some(existing) if existing.will_wake(cx.waker()) => {}
                    _ => *waker = Some(cx.waker().clone()),
                }
            }
            None => {
                let registration = Arc::new(Registration::default());
                *registration.waker.lock() = Some(cx.waker().clone());
                TIMER.register(this.deadline, registration.clone());
                this.registration = Some(registration);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        // The heap entry stays until its deadline; it just has nobody to wake.
        if let Some(registration) = self.registration.take() {
            registration.waker.lock().take();
        }
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("registered", &self.registration.is_some())
            .finish()
    }
}

/// The deadline of a [`timeout`] passed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline has elapsed")]
pub struct Elapsed;

/// Run `future` with a deadline. The future is dropped if it has not
/// finished by then.
pub fn timeout<F: Future>(
    duration: Duration,
    future: F,
) -> Timeout<F> {
    Timeout {
        future: Box::pin(future),
        sleep: sleep(duration),
    }
}

/// Future returned by [`timeout`].
#[must_use = "futures do nothing unless awaited"]
pub struct Timeout<F> {
    future: Pin<Box<F>>,
    sleep: Sleep,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(output) = this.future.as_mut().poll(cx) {
            return Poll::Ready(Ok(output));
        }
        match Pin::new(&mut this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
