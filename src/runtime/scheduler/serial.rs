//! Serial executor.
//!
//! Gives actor-style mutual exclusion on top of another executor. Jobs are
//! kept in a private priority-bucketed queue; whenever there is work, one
//! drain job is handed to the inner executor and runs queued jobs one after
//! another on whichever thread the inner executor picked. Two jobs of the
//! same serial executor never overlap, FIFO order holds within a priority,
//! and an escalated job moves ahead of lower-priority work.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Executor, ExecutorStats, Job, JobQueue};
use crate::runtime::task::{TaskPriority, TaskRef};

/// Jobs one drain runs before it gives its thread back to the inner executor.
const DRAIN_BUDGET: usize = 32;

#[derive(Debug, Default)]
struct DrainState {
    /// A drain job has been submitted and has not yet gone idle.
    scheduled: bool,
    /// A drain job is running jobs right now.
    draining: bool,
    /// Priority the pending drain job was submitted at.
    priority: TaskPriority,
}

pub struct SerialExecutor {
    name: String,
    inner: Arc<dyn Executor>,
    jobs: JobQueue,
    state: Mutex<DrainState>,
    stats: ExecutorStats,
    this: Weak<SerialExecutor>,
}

impl SerialExecutor {
    /// Serialize jobs on top of `inner`.
    pub fn new(inner: Arc<dyn Executor>) -> Arc<Self> {
        Self::with_name("weft-serial", inner)
    }

    pub fn with_name(
        name: impl Into<String>,
        inner: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let name = name.into();
        debug!(executor = %name, inner = inner.name(), "serial executor created");
        Arc::new_cyclic(|this| Self {
            name,
            inner,
            jobs: JobQueue::new(),
            state: Mutex::new(DrainState::default()),
            stats: ExecutorStats::default(),
            this: this.clone(),
        })
    }

    /// The executor drains run on.
    #[inline]
    pub fn inner(&self) -> &Arc<dyn Executor> {
        &self.inner
    }

    /// Jobs waiting for their turn.
    #[inline]
    pub fn queued(&self) -> usize {
        self.jobs.len()
    }

    #[inline]
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    /// Make sure a drain is on its way at `priority` or higher.
    fn schedule(
        &self,
        priority: TaskPriority,
    ) {
        let priority = priority.or_default();
        let submit = {
            let mut state = self.state.lock();
            if !state.scheduled {
                state.scheduled = true;
                state.priority = priority;
                true
            } else if priority > state.priority && !state.draining {
                // The drain already submitted sits at a lower priority; a
                // second one at the new priority takes over whichever of the
                // two starts first.
                state.priority = priority;
                true
            } else {
                false
            }
        };
        if !submit {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        trace!(executor = %self.name, %priority, "submitting drain");
        self.inner.enqueue(Job::from_fn(priority, move || this.drain()));
    }

    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining || !state.scheduled {
                // Another drain owns the queue, or an earlier one already
                // emptied it.
                return;
            }
            state.draining = true;
        }
        let Some(executor) = self.this.upgrade().map(|this| this as Arc<dyn Executor>) else {
            return;
        };

        let mut ran = 0;
        loop {
            if ran == DRAIN_BUDGET {
                let priority = {
                    let mut state = self.state.lock();
                    state.draining = false;
                    state.scheduled = false;
                    state.priority
                };
                trace!(executor = %self.name, ran, "drain budget used, yielding");
                self.schedule(priority);
                return;
            }
            match self.jobs.pop() {
                Some(job) => {
                    job.run(&executor);
                    self.stats.record_run();
                    ran += 1;
                }
                None => {
                    let mut state = self.state.lock();
                    // An enqueue pushes before it looks at `scheduled`, so an
                    // empty queue seen under the lock stays covered.
                    if self.jobs.is_empty() {
                        state.draining = false;
                        state.scheduled = false;
                        break;
                    }
                }
            }
        }
        trace!(executor = %self.name, ran, "serial executor idle");
    }
}

impl Executor for SerialExecutor {
    fn enqueue(
        &self,
        job: Job,
    ) {
        self.stats.record_enqueued();
        let priority = job.priority();
        if let Err(job) = self.jobs.push(job) {
            debug!(executor = %self.name, ?job, "job submitted to a closed serial executor was dropped");
            return;
        }
        self.schedule(priority);
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn escalate(
        &self,
        task: &TaskRef,
        priority: TaskPriority,
    ) {
        if self.jobs.escalate(task.id(), priority) {
            trace!(executor = %self.name, task = %task.id(), %priority, "queued job re-bucketed");
        }
        self.schedule(priority);
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("inner", &self.inner.name())
            .field("queued", &self.queued())
            .field("stats", &self.stats)
            .finish()
    }
}
