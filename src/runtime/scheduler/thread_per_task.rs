//! Thread-per-task executor.
//!
//! Every task gets a dedicated OS thread the first time one of its jobs is
//! enqueued. Later jobs for the same task are forwarded to that thread over
//! a channel; the thread exits once its task has completed or is gone.
//! Closure jobs each run on a fresh thread.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Executor, ExecutorStats, Job};
use crate::runtime::error::{fatal, FatalError};
use crate::runtime::task::{TaskId, WeakTaskRef};

/// How often an idle task thread checks whether its task still exists.
const LIVENESS_CHECK: Duration = Duration::from_millis(100);

pub struct ThreadPerTaskExecutor {
    threads: Mutex<HashMap<TaskId, Sender<Job>>>,
    stats: ExecutorStats,
    this: Weak<ThreadPerTaskExecutor>,
}

impl ThreadPerTaskExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            threads: Mutex::new(HashMap::new()),
            stats: ExecutorStats::default(),
            this: this.clone(),
        })
    }

    /// Tasks that currently own a thread.
    pub fn live_threads(&self) -> usize {
        self.threads.lock().len()
    }

    #[inline]
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    fn spawn_task_thread(
        &self,
        id: TaskId,
        task: WeakTaskRef,
        jobs: Receiver<Job>,
    ) {
        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name(format!("weft-task-{}", id.as_u64()))
            .spawn(move || task_thread(id, task, jobs, this));
        if let Err(error) = spawned {
            fatal(FatalError::InvalidState(format!(
                "failed to spawn thread for {}: {}",
                id, error
            )));
        }
    }

    fn spawn_closure_thread(
        &self,
        job: Job,
    ) {
        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name("weft-job".to_string())
            .spawn(move || {
                let Some(this) = this.upgrade() else {
                    return;
                };
                let executor: Arc<dyn Executor> = this.clone();
                job.run(&executor);
                this.stats.record_run();
            });
        if let Err(error) = spawned {
            fatal(FatalError::InvalidState(format!(
                "failed to spawn job thread: {}",
                error
            )));
        }
    }
}

fn task_thread(
    id: TaskId,
    task: WeakTaskRef,
    jobs: Receiver<Job>,
    executor: Weak<ThreadPerTaskExecutor>,
) {
    trace!(task = %id, "task thread started");
    loop {
        match jobs.recv_timeout(LIVENESS_CHECK) {
            Ok(job) => {
                let Some(this) = executor.upgrade() else {
                    break;
                };
                let dyn_executor: Arc<dyn Executor> = this.clone();
                job.run(&dyn_executor);
                this.stats.record_run();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let finished = task.upgrade().map_or(true, |task| task.is_completed());
        if finished {
            break;
        }
    }

    // Unregister, then run whatever raced in before the entry disappeared.
    if let Some(this) = executor.upgrade() {
        this.threads.lock().remove(&id);
        let dyn_executor: Arc<dyn Executor> = this.clone();
        while let Ok(job) = jobs.try_recv() {
            job.run(&dyn_executor);
        }
    }
    trace!(task = %id, "task thread exited");
}

impl Executor for ThreadPerTaskExecutor {
    fn enqueue(
        &self,
        job: Job,
    ) {
        self.stats.record_enqueued();
        let Some(task) = job.task() else {
            self.spawn_closure_thread(job);
            return;
        };
        let id = task.id();
        let weak = task.downgrade();

        let mut threads = self.threads.lock();
        let job = match threads.get(&id) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(channel::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, receiver) = channel::unbounded();
        // The receiver is alive, sending cannot fail.
        let _ = sender.send(job);
        threads.insert(id, sender);
        drop(threads);

        debug!(task = %id, "spawning dedicated task thread");
        self.spawn_task_thread(id, weak, receiver);
    }

    fn name(&self) -> &str {
        "thread-per-task"
    }
}

impl fmt::Debug for ThreadPerTaskExecutor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ThreadPerTaskExecutor")
            .field("live_threads", &self.live_threads())
            .field("stats", &self.stats)
            .finish()
    }
}
