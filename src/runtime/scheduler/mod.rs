//! Executors and jobs
//!
//! The runtime never decides on its own where code runs. A [`Job`] (a task
//! to poll, or a one-shot closure) is handed to an [`Executor`], and the
//! executor decides which thread runs it and when. Three executors ship with
//! the crate:
//!
//! - [`ThreadPoolExecutor`]: a fixed set of worker threads over a
//!   priority-bucketed queue.
//! - [`CooperativeExecutor`]: a single-threaded loop drained by its owner.
//! - [`ThreadPerTaskExecutor`]: one dedicated OS thread per task.
//!
//! [`SerialExecutor`] layers on top of any of them and never runs two of its
//! jobs at once.
//!
//! Which one backs a [`Runtime`](crate::runtime::Runtime) is picked at
//! runtime through [`ExecutorKind`].

pub mod cooperative;
pub mod queue;
pub mod serial;
pub mod thread_per_task;
pub mod thread_pool;

pub use cooperative::CooperativeExecutor;
pub use queue::JobQueue;
pub use serial::SerialExecutor;
pub use thread_per_task::ThreadPerTaskExecutor;
pub use thread_pool::ThreadPoolExecutor;

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::runtime::task::{TaskPriority, TaskRef};

/// Something that runs jobs.
pub trait Executor: Send + Sync + 'static {
    /// Accept a job for asynchronous execution.
    fn enqueue(
        &self,
        job: Job,
    );

    /// Name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Block the calling thread until `task` has completed. Executors whose
    /// jobs only run when their owner drives them override this.
    fn block_until_complete(
        &self,
        task: &TaskRef,
    ) {
        task.wait_blocking();
    }

    /// `task` was raised to `priority` while a job for it sits in this
    /// executor's queue. Executors that order by priority move that job;
    /// the rest ignore it.
    fn escalate(
        &self,
        task: &TaskRef,
        priority: TaskPriority,
    ) {
        let _ = (task, priority);
    }
}

enum JobKind {
    Task(TaskRef),
    Closure(Box<dyn FnOnce() + Send>),
}

/// The minimal schedulable unit.
pub struct Job {
    kind: JobKind,
    priority: TaskPriority,
}

impl Job {
    /// A job polling `task`.
    pub fn from_task(task: TaskRef) -> Self {
        let priority = task.current_priority();
        Self {
            kind: JobKind::Task(task),
            priority,
        }
    }

    /// A job running `f` once.
    pub fn from_fn<F>(
        priority: TaskPriority,
        f: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            kind: JobKind::Closure(Box::new(f)),
            priority: priority.or_default(),
        }
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Raise the priority the job is queued under. Never lowers it.
    pub(crate) fn raise(
        &mut self,
        priority: TaskPriority,
    ) {
        if priority > self.priority {
            self.priority = priority;
        }
    }

    /// The task this job resumes, if any.
    pub fn task(&self) -> Option<&TaskRef> {
        match &self.kind {
            JobKind::Task(task) => Some(task),
            JobKind::Closure(_) => None,
        }
    }

    /// Execute the job on the current thread on behalf of `executor`.
    pub fn run(
        self,
        executor: &Arc<dyn Executor>,
    ) {
        let _active = ActiveExecutor::enter(executor);
        match self.kind {
            JobKind::Task(task) => task.run(executor),
            JobKind::Closure(f) => {
                if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    warn!(executor = executor.name(), "job closure panicked");
                }
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut s = f.debug_struct("Job");
        match &self.kind {
            JobKind::Task(task) => s.field("task", &task.id()),
            JobKind::Closure(_) => s.field("task", &None::<()>),
        };
        s.field("priority", &self.priority).finish()
    }
}

thread_local! {
    static ACTIVE_EXECUTOR: Cell<usize> = const { Cell::new(0) };
}

fn executor_addr(executor: &Arc<dyn Executor>) -> usize {
    Arc::as_ptr(executor).cast::<()>() as usize
}

/// Marks `executor` as the one running jobs on this thread until dropped,
/// then restores whatever was active before.
struct ActiveExecutor {
    saved: usize,
}

impl ActiveExecutor {
    fn enter(executor: &Arc<dyn Executor>) -> Self {
        let saved = ACTIVE_EXECUTOR.with(|active| active.replace(executor_addr(executor)));
        Self { saved }
    }
}

impl Drop for ActiveExecutor {
    fn drop(&mut self) {
        ACTIVE_EXECUTOR.with(|active| active.set(self.saved));
    }
}

/// Whether the calling thread is running a job on behalf of `executor`.
/// With nested executors only the innermost one counts.
pub fn is_current_executor(executor: &Arc<dyn Executor>) -> bool {
    ACTIVE_EXECUTOR.with(|active| active.get()) == executor_addr(executor)
}

/// Post `job` to `executor`. Task jobs go through the task's state machine,
/// so a task that is already queued or finished is not queued twice.
pub fn enqueue(
    job: Job,
    executor: &Arc<dyn Executor>,
) {
    match job.kind {
        JobKind::Task(task) => task.enqueue(executor),
        kind => executor.enqueue(Job {
            kind,
            priority: job.priority,
        }),
    }
}

/// Run `job` inline, as if `executor` had picked it.
pub fn run(
    job: Job,
    executor: &Arc<dyn Executor>,
) {
    job.run(executor)
}

/// Selects the executor a runtime is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    ThreadPool,
    Cooperative,
    ThreadPerTask,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::ThreadPool => "thread_pool",
            ExecutorKind::Cooperative => "cooperative",
            ExecutorKind::ThreadPerTask => "thread_per_task",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "thread_pool" | "pool" => Ok(ExecutorKind::ThreadPool),
            "cooperative" | "coop" => Ok(ExecutorKind::Cooperative),
            "thread_per_task" => Ok(ExecutorKind::ThreadPerTask),
            other => Err(format!("unknown executor kind `{}`", other)),
        }
    }
}

/// Executor counters.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Jobs accepted through `enqueue`.
    pub jobs_enqueued: AtomicUsize,
    /// Jobs run to the end of one poll.
    pub jobs_run: AtomicUsize,
}

impl ExecutorStats {
    #[inline]
    pub fn record_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_run(&self) {
        self.jobs_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> usize {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn run(&self) -> usize {
        self.jobs_run.load(Ordering::Relaxed)
    }
}
