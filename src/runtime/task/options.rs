//! Task creation options.

use std::fmt;
use std::sync::Arc;

use super::state::TaskPriority;
use super::TaskRef;
use crate::runtime::memory::DEFAULT_SLAB_SIZE;
use crate::runtime::scheduler::Executor;

/// Options for creating a task, built in the usual builder style.
///
/// ```
/// use weft::runtime::task::{TaskOptions, TaskPriority};
///
/// let options = TaskOptions::new()
///     .name("fetch")
///     .priority(TaskPriority::HIGH);
/// assert_eq!(options.requested_priority(), TaskPriority::HIGH);
/// ```
#[derive(Clone)]
pub struct TaskOptions {
    pub(crate) name: Option<String>,
    pub(crate) priority: TaskPriority,
    pub(crate) inherit_priority: bool,
    pub(crate) executor: Option<Arc<dyn Executor>>,
    pub(crate) parent: Option<TaskRef>,
    pub(crate) slab_size: usize,
}

impl TaskOptions {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request a priority. Children are still raised to their parent's
    /// current priority unless inheritance is switched off.
    #[inline]
    pub fn priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn inherit_priority(
        mut self,
        inherit: bool,
    ) -> Self {
        self.inherit_priority = inherit;
        self
    }

    /// Executor the task starts on. Children default to the executor their
    /// parent is currently running on.
    #[inline]
    pub fn executor(
        mut self,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Make the task a child of `parent`: it inherits the parent's
    /// cancellation and (by default) priority.
    #[inline]
    pub fn parent(
        mut self,
        parent: &TaskRef,
    ) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Minimum slab size of the task's allocator.
    #[inline]
    pub fn slab_size(
        mut self,
        size: usize,
    ) -> Self {
        self.slab_size = size;
        self
    }

    #[inline]
    pub fn requested_priority(&self) -> TaskPriority {
        self.priority
    }

    /// The priority a task created with these options starts at.
    pub(crate) fn initial_priority(&self) -> TaskPriority {
        let inherited = match &self.parent {
            Some(parent) if self.inherit_priority => parent.current_priority(),
            _ => TaskPriority::UNSPECIFIED,
        };
        self.priority.max(inherited).or_default()
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            priority: TaskPriority::UNSPECIFIED,
            inherit_priority: true,
            executor: None,
            parent: None,
            slab_size: DEFAULT_SLAB_SIZE,
        }
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("inherit_priority", &self.inherit_priority)
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .field("parent", &self.parent.as_ref().map(TaskRef::id))
            .field("slab_size", &self.slab_size)
            .finish()
    }
}
