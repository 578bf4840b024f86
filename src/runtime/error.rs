//! Runtime errors
//!
//! Two very different kinds of failure live here. [`TaskError`] is the
//! outcome a task body completes with and flows to whoever awaits the task.
//! [`FatalError`] describes a broken runtime invariant; those are never
//! returned, they are reported through [`fatal`] which ends the process.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type produced by task bodies.
pub type TaskResult<T> = Result<T, TaskError>;

/// Error a task completed with.
///
/// Cloning is cheap; every awaiter of the same task observes the same
/// underlying error value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The body noticed cancellation and chose to stop.
    #[error("task was cancelled")]
    Cancelled,

    /// The body panicked while being polled.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The body returned an error.
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The outcome was already taken by someone else (another awaiter, or
    /// the task group the child belongs to).
    #[error("task result was already consumed")]
    Consumed,
}

impl TaskError {
    /// Wrap any error as a task failure.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Failed(Arc::new(anyhow::Error::new(error)))
    }

    /// Build a task failure from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        TaskError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// Whether this error is the cancellation error.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// Whether `self` and `other` are the same error value (not merely equal).
    pub fn same_as(
        &self,
        other: &TaskError,
    ) -> bool {
        match (self, other) {
            (TaskError::Cancelled, TaskError::Cancelled) => true,
            (TaskError::Consumed, TaskError::Consumed) => true,
            (TaskError::Panicked(a), TaskError::Panicked(b)) => a == b,
            (TaskError::Failed(a), TaskError::Failed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        TaskError::Panicked(message)
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(error))
    }
}

/// A violated runtime invariant.
///
/// Continuing after any of these would mean operating on a corrupt status
/// chain or on freed memory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("retain of deallocating object `{0}`")]
    RetainDeallocating(&'static str),

    #[error("over-release of object `{0}`")]
    OverRelease(&'static str),

    #[error("unowned access to deallocated object `{0}`")]
    UnownedAfterDealloc(&'static str),

    #[error("unowned refcount underflow on `{0}`")]
    UnownedUnderflow(&'static str),

    #[error("status record {record} is not on the chain of task {task}")]
    RecordNotFound { task: u64, record: String },

    #[error("out-of-order removal of {kind} record {record} on task {task}")]
    MismatchedPop {
        task: u64,
        record: String,
        kind: &'static str,
    },

    #[error("child task {child} is not linked under record {record}")]
    ChildNotLinked { child: u64, record: String },

    #[error("task group destroyed with {pending} pending children")]
    GroupNotEmpty { pending: usize },

    #[error("task group used after being destroyed")]
    GroupDestroyed,

    #[error("task allocator: {0}")]
    Allocator(String),

    #[error("invalid task state: {0}")]
    InvalidState(String),
}

/// Report a fatal runtime error and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(error: FatalError) -> ! {
    tracing::error!(%error, "fatal runtime error");
    eprintln!("weft: fatal runtime error: {}", error);
    std::process::abort()
}
