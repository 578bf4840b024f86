//! Cooperative executor.
//!
//! A single event loop: jobs pile up in a FIFO queue and only run while the
//! owner drives the executor through [`CooperativeExecutor::run_until_idle`]
//! or [`CooperativeExecutor::block_on`]. Other threads may enqueue (a timer
//! firing, a continuation being resumed), but every job runs on the driving
//! thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Executor, ExecutorStats, Job};
use crate::runtime::error::TaskResult;
use crate::runtime::task::{Task, TaskRef};

/// How long `block_on` sleeps before re-checking a task that completes
/// somewhere else.
const IDLE_RECHECK: Duration = Duration::from_millis(10);

pub struct CooperativeExecutor {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    stats: ExecutorStats,
    this: Weak<CooperativeExecutor>,
}

impl CooperativeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stats: ExecutorStats::default(),
            this: this.clone(),
        })
    }

    /// Run queued jobs until the queue is empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let Some(executor) = self.as_executor() else {
            return 0;
        };
        let mut ran = 0;
        while let Some(job) = self.pop() {
            self.run_job(job, &executor);
            ran += 1;
        }
        trace!(ran, "cooperative executor idle");
        ran
    }

    /// Run one queued job, if any.
    pub fn run_once(&self) -> bool {
        let Some(executor) = self.as_executor() else {
            return false;
        };
        match self.pop() {
            Some(job) => {
                self.run_job(job, &executor);
                true
            }
            None => false,
        }
    }

    /// Start `task` here and drive the loop until it has completed.
    pub fn block_on<T: Send + 'static>(
        &self,
        task: Task<T>,
    ) -> TaskResult<T> {
        if let Some(executor) = self.as_executor() {
            task.task_ref().enqueue(&executor);
        }
        self.drive_until(task.task_ref());
        task.wait_blocking()
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    #[inline]
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    fn drive_until(
        &self,
        task: &TaskRef,
    ) {
        let Some(executor) = self.as_executor() else {
            return;
        };
        while !task.is_completed() {
            let job = {
                let mut queue = self.queue.lock();
                if queue.is_empty() {
                    self.available.wait_for(&mut queue, IDLE_RECHECK);
                }
                queue.pop_front()
            };
            if let Some(job) = job {
                self.run_job(job, &executor);
            }
        }
    }

    fn pop(&self) -> Option<Job> {
        self.queue.lock().pop_front()
    }

    fn run_job(
        &self,
        job: Job,
        executor: &Arc<dyn Executor>,
    ) {
        job.run(executor);
        self.stats.record_run();
    }

    fn as_executor(&self) -> Option<Arc<dyn Executor>> {
        self.this.upgrade().map(|this| this as Arc<dyn Executor>)
    }
}

impl Executor for CooperativeExecutor {
    fn enqueue(
        &self,
        job: Job,
    ) {
        self.stats.record_enqueued();
        self.queue.lock().push_back(job);
        self.available.notify_all();
    }

    fn name(&self) -> &str {
        "cooperative"
    }

    fn block_until_complete(
        &self,
        task: &TaskRef,
    ) {
        self.drive_until(task);
    }
}

impl fmt::Debug for CooperativeExecutor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CooperativeExecutor")
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}
