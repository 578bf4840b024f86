//! Async-let
//!
//! A single structured child bound to a scope of its parent. The child is
//! started right away on the parent's executor and linked under its own
//! child-task record, so cancelling the parent reaches it. The parent
//! collects the outcome with [`AsyncLet::get`] (any number of times) or
//! [`AsyncLet::consume`]; leaving the scope without awaiting cancels the
//! child.
//!
//! The outcome is parked in a buffer carved from the parent's slab
//! allocator when it is small enough, otherwise on the heap.

use std::alloc::Layout;
use std::fmt;
use std::future::Future;
use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::runtime::error::{fatal, FatalError, TaskError, TaskResult};
use crate::runtime::task::{
    create_child_task, CurrentTask, RecordId, TaskId, TaskOptions, TaskRef, WeakTaskRef,
};

/// Outcomes up to this size are parked in the parent's slab.
pub const MAX_SLAB_RESULT: usize = 256;

type Slot<T> = Option<TaskResult<T>>;

enum Storage<T> {
    /// Carved from the parent's allocator.
    Slab(NonNull<Slot<T>>),
    Heap(Box<Slot<T>>),
}

/// Where an outcome lives once collected.
struct ResultBuffer<T> {
    storage: Storage<T>,
}

impl<T> ResultBuffer<T> {
    fn new(parent: &TaskRef) -> Self {
        let layout = Layout::new::<Slot<T>>();
        let storage = if layout.size() <= MAX_SLAB_RESULT {
            let raw = parent.alloc(layout).cast::<Slot<T>>();
            // Safety: freshly allocated for this layout
            unsafe { raw.as_ptr().write(None) };
            Storage::Slab(raw)
        } else {
            Storage::Heap(Box::new(None))
        };
        Self { storage }
    }

    fn in_slab(&self) -> bool {
        matches!(self.storage, Storage::Slab(_))
    }

    fn slot(&self) -> &Slot<T> {
        match &self.storage {
            // Safety: initialised in `new`, live until `release`
            Storage::Slab(raw) => unsafe { raw.as_ref() },
            Storage::Heap(boxed) => boxed,
        }
    }

    fn slot_mut(&mut self) -> &mut Slot<T> {
        match &mut self.storage {
            // Safety: as above, and `&mut self` makes it exclusive
            Storage::Slab(raw) => unsafe { raw.as_mut() },
            Storage::Heap(boxed) => boxed,
        }
    }

    /// Drop the parked value and hand slab memory back to `parent`. When the
    /// parent is already gone its allocator reclaims the slab wholesale.
    fn release(
        &mut self,
        parent: Option<&TaskRef>,
    ) {
        if let Storage::Slab(raw) = self.storage {
            // Safety: initialised in `new` and never dropped before
            unsafe { ptr::drop_in_place(raw.as_ptr()) };
            if let Some(parent) = parent {
                parent.dealloc(raw.cast());
            }
            self.storage = Storage::Heap(Box::new(None));
        }
    }
}

/// A child task started with `async let` semantics.
///
/// ```no_run
/// use weft::runtime::async_let::AsyncLet;
/// use weft::runtime::task::{CurrentTask, TaskOptions};
/// use weft::runtime::error::TaskResult;
///
/// async fn body(current: CurrentTask) -> TaskResult<u64> {
///     let mut left = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(20u64) });
///     let right = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(22u64) });
///     let left = *left.get().await?;
///     Ok(left + right.consume().await?)
/// }
/// ```
pub struct AsyncLet<T: Send + 'static> {
    child: TaskRef,
    parent: WeakTaskRef,
    record: RecordId,
    buffer: ResultBuffer<T>,
    collected: bool,
}

// Safety: the slab buffer is owned exclusively by this handle, like a Box.
unsafe impl<T: Send + 'static> Send for AsyncLet<T> {}
// Safety: shared access only reads the parked outcome.
unsafe impl<T: Send + Sync + 'static> Sync for AsyncLet<T> {}

impl<T: Send + 'static> AsyncLet<T> {
    /// Start `body` as a structured child of the running task.
    ///
    /// The child runs on `options`' executor if set, otherwise on the
    /// executor the parent is running on.
    pub fn begin<F, Fut>(
        current: &CurrentTask,
        options: TaskOptions,
        body: F,
    ) -> Self
    where
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let parent = current.task();
        let executor = match options.executor.clone().or_else(|| parent.current_executor()) {
            Some(executor) => executor,
            None => fatal(FatalError::InvalidState(format!(
                "{} has no executor to start an async let on",
                parent.id()
            ))),
        };

        let buffer = ResultBuffer::new(&parent);
        let (child, record) = create_child_task(&parent, options, body);
        let child = child.into_ref();
        debug!(
            parent = %parent.id(),
            child = %child.id(),
            in_slab = buffer.in_slab(),
            "async let started"
        );
        child.enqueue(&executor);

        Self {
            child,
            parent: parent.downgrade(),
            record,
            buffer,
            collected: false,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.child.id()
    }

    #[inline]
    pub fn task_ref(&self) -> &TaskRef {
        &self.child
    }

    /// Whether the outcome sits in the parent's slab rather than the heap.
    #[inline]
    pub fn is_slab_allocated(&self) -> bool {
        self.buffer.in_slab()
    }

    /// Wait for the child, escalating it to the parent's priority, and
    /// borrow its value. Later calls return the same outcome.
    pub async fn get(&mut self) -> TaskResult<&T> {
        self.collect().await;
        match self.buffer.slot() {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(error.clone()),
            None => Err(TaskError::Consumed),
        }
    }

    /// Wait for the child and take its value.
    pub async fn consume(mut self) -> TaskResult<T> {
        self.collect().await;
        self.buffer.slot_mut().take().unwrap_or(Err(TaskError::Consumed))
    }

    /// End the scope: a child that was never awaited is cancelled, then
    /// waited for.
    pub async fn finish(self) {
        if !self.collected {
            self.child.cancel();
            self.child.wait().await;
        }
        trace!(child = %self.child.id(), "async let finished");
    }

    async fn collect(&mut self) {
        if self.collected {
            return;
        }
        match self.parent.upgrade() {
            Some(parent) => {
                self.child
                    .wait_escalating(parent.current_priority())
                    .await
            }
            None => self.child.wait().await,
        }
        let outcome = self.child.take_typed::<T>();
        *self.buffer.slot_mut() = Some(outcome);
        self.collected = true;
    }
}

impl<T: Send + 'static> Drop for AsyncLet<T> {
    fn drop(&mut self) {
        if !self.child.is_completed() {
            trace!(child = %self.child.id(), "async let dropped before completion, cancelling");
            self.child.cancel();
        }
        let parent = self.parent.upgrade();
        if let Some(parent) = &parent {
            parent.remove_child_record(self.record);
        }
        self.buffer.release(parent.as_ref());
    }
}

impl<T: Send + 'static> fmt::Debug for AsyncLet<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AsyncLet")
            .field("child", &self.child.id())
            .field("record", &self.record)
            .field("collected", &self.collected)
            .field("in_slab", &self.buffer.in_slab())
            .finish()
    }
}

#[cfg(test)]
mod tests;
