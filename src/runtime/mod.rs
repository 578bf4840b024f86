//! Runtime system
//!
//! Reference-counted heap objects, tasks and their status records, task
//! groups, async-let, executors, and the suspension primitives tasks await.

pub mod async_let;
pub mod continuation;
pub mod error;
pub mod group;
pub mod heap;
pub mod memory;
pub mod reflection;
pub mod rt;
pub mod scheduler;
pub mod task;
pub mod time;

pub use async_let::AsyncLet;
pub use continuation::{continuation, with_continuation, yield_now, Continuation};
pub use error::{TaskError, TaskResult};
pub use group::{with_task_group, GroupMode, TaskGroup};
pub use rt::Runtime;
pub use task::{cancel, escalate, CurrentTask, Task, TaskId, TaskOptions, TaskPriority, TaskRef};
pub use time::{sleep, timeout};
