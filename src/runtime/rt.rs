//! Runtime facade
//!
//! Owns one executor, chosen from [`RuntimeConfig::executor`], and the task
//! defaults taken from the configuration. Task bodies are written the same
//! way whichever executor drives them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::runtime::error::TaskResult;
use crate::runtime::scheduler::{
    CooperativeExecutor, Executor, ExecutorKind, SerialExecutor, ThreadPerTaskExecutor,
    ThreadPoolExecutor,
};
use crate::runtime::task::{self, CurrentTask, Task, TaskOptions};
use crate::util::config::{ConfigError, RuntimeConfig};

enum Flavor {
    ThreadPool(Arc<ThreadPoolExecutor>),
    Cooperative(Arc<CooperativeExecutor>),
    ThreadPerTask(Arc<ThreadPerTaskExecutor>),
}

/// A configured executor plus task defaults.
///
/// ```
/// use weft::runtime::Runtime;
/// use weft::util::config::RuntimeConfig;
///
/// let config = RuntimeConfig::from_toml_str("executor = \"cooperative\"").unwrap();
/// let runtime = Runtime::from_config(config).unwrap();
/// let answer = runtime.block_on(|_| async { Ok(6 * 7) }).unwrap();
/// assert_eq!(answer, 42);
/// ```
pub struct Runtime {
    config: RuntimeConfig,
    flavor: Flavor,
    executor: Arc<dyn Executor>,
}

impl Runtime {
    /// A runtime with the default configuration.
    pub fn new() -> Self {
        Self::build(RuntimeConfig::default())
    }

    /// A runtime for a validated configuration.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RuntimeConfig) -> Self {
        let (flavor, executor): (Flavor, Arc<dyn Executor>) = match config.executor {
            ExecutorKind::ThreadPool => {
                let pool = ThreadPoolExecutor::new(config.workers);
                (Flavor::ThreadPool(pool.clone()), pool)
            }
            ExecutorKind::Cooperative => {
                let executor = CooperativeExecutor::new();
                (Flavor::Cooperative(executor.clone()), executor)
            }
            ExecutorKind::ThreadPerTask => {
                let executor = ThreadPerTaskExecutor::new();
                (Flavor::ThreadPerTask(executor.clone()), executor)
            }
        };
        info!(
            executor = %config.executor,
            workers = config.workers,
            "runtime started"
        );
        Self {
            config,
            flavor,
            executor,
        }
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn kind(&self) -> ExecutorKind {
        self.config.executor
    }

    #[inline]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// The cooperative executor, when that is the configured kind.
    pub fn cooperative(&self) -> Option<&Arc<CooperativeExecutor>> {
        match &self.flavor {
            Flavor::Cooperative(executor) => Some(executor),
            _ => None,
        }
    }

    /// A fresh serial executor whose drains run on this runtime's executor.
    pub fn serial_executor(
        &self,
        name: impl Into<String>,
    ) -> Arc<SerialExecutor> {
        SerialExecutor::with_name(name, self.executor.clone())
    }

    /// Options carrying this runtime's defaults.
    pub fn task_options(&self) -> TaskOptions {
        TaskOptions::new()
            .priority(self.config.default_priority)
            .slab_size(self.config.slab_size)
            .executor(self.executor.clone())
    }

    /// Create a task with the runtime defaults and enqueue it.
    pub fn spawn<T, F, Fut>(
        &self,
        body: F,
    ) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        self.spawn_with(self.task_options(), body)
    }

    /// Create a task with explicit options and enqueue it on this runtime.
    pub fn spawn_with<T, F, Fut>(
        &self,
        options: TaskOptions,
        body: F,
    ) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let task = task::create(options, body);
        task.task_ref().enqueue(&self.executor);
        task
    }

    /// Run a task to completion from outside the runtime.
    pub fn block_on<T, F, Fut>(
        &self,
        body: F,
    ) -> TaskResult<T>
    where
        T: Send + 'static,
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let task = self.spawn(body);
        self.wait(task)
    }

    /// Wait for a task spawned on this runtime. On the cooperative executor
    /// this drives the event loop.
    pub fn wait<T: Send + 'static>(
        &self,
        task: Task<T>,
    ) -> TaskResult<T> {
        self.executor.block_until_complete(task.task_ref());
        task.wait_blocking()
    }

    /// Stop the executor. Only the thread pool holds threads that need
    /// joining; the others wind down on their own.
    pub fn shutdown(&self) {
        if let Flavor::ThreadPool(pool) = &self.flavor {
            pool.shutdown();
        }
        info!(executor = %self.config.executor, "runtime shut down");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .finish()
    }
}
