//! Thread-pool executor.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Executor, ExecutorStats, Job, JobQueue};
use crate::runtime::error::{fatal, FatalError};
use crate::runtime::task::{TaskPriority, TaskRef};

/// Fixed set of worker threads sharing one priority-bucketed queue.
pub struct ThreadPoolExecutor {
    name: String,
    queue: Arc<JobQueue>,
    stats: Arc<ExecutorStats>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// Start a pool with `num_workers` threads (at least one).
    pub fn new(num_workers: usize) -> Arc<Self> {
        Self::with_name("weft-pool", num_workers)
    }

    pub fn with_name(
        name: impl Into<String>,
        num_workers: usize,
    ) -> Arc<Self> {
        let name = name.into();
        let num_workers = num_workers.max(1);
        let pool = Arc::new(Self {
            name: name.clone(),
            queue: Arc::new(JobQueue::new()),
            stats: Arc::new(ExecutorStats::default()),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        });

        let mut workers = pool.workers.lock();
        for worker_id in 0..num_workers {
            let queue = pool.queue.clone();
            let stats = pool.stats.clone();
            let weak = Arc::downgrade(&pool);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || Self::worker_loop(worker_id, &queue, &stats, weak));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => fatal(FatalError::InvalidState(format!(
                    "failed to spawn worker thread: {}",
                    error
                ))),
            }
        }
        drop(workers);

        debug!(executor = %name, num_workers, "thread pool started");
        pool
    }

    fn worker_loop(
        worker_id: usize,
        queue: &JobQueue,
        stats: &ExecutorStats,
        pool: Weak<ThreadPoolExecutor>,
    ) {
        trace!(worker_id, "worker started");
        while let Some(job) = queue.pop_blocking() {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            let executor: Arc<dyn Executor> = pool;
            job.run(&executor);
            stats.record_run();
        }
        trace!(worker_id, "worker stopped");
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Jobs waiting for a worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    /// Stop accepting jobs, let workers drain the queue and join them.
    /// Calling this from one of the pool's own workers skips joining that
    /// worker.
    pub fn shutdown(&self) {
        self.queue.close();
        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(executor = %self.name, "worker thread panicked");
            }
        }
        debug!(executor = %self.name, "thread pool shut down");
    }
}

impl Executor for ThreadPoolExecutor {
    fn enqueue(
        &self,
        job: Job,
    ) {
        self.stats.record_enqueued();
        if let Err(job) = self.queue.push(job) {
            warn!(executor = %self.name, ?job, "job submitted to a shut-down pool was dropped");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn escalate(
        &self,
        task: &TaskRef,
        priority: TaskPriority,
    ) {
        if self.queue.escalate(task.id(), priority) {
            trace!(executor = %self.name, task = %task.id(), %priority, "queued job re-bucketed");
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.name)
            .field("num_workers", &self.num_workers())
            .field("queued", &self.queued())
            .field("stats", &self.stats)
            .finish()
    }
}
