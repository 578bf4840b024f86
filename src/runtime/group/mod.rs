//! Task groups
//!
//! A task group owns a dynamic set of child tasks spawned by one parent.
//! Children are linked under a task-group status record on the parent, so
//! cancelling the parent reaches them. Completed children are offered to
//! the group: accumulating groups queue their results for [`TaskGroup::next`],
//! discarding groups drop values and only remember the first error.
//!
//! Bookkeeping is lock-free: one atomic word holds the pending count plus
//! the cancelled and destroyed bits, and completed results go through a
//! `crossbeam` [`SegQueue`]. The only lock is the slot for the parent's
//! waker.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bitflags::bitflags;
use crossbeam::queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::runtime::error::{fatal, FatalError, TaskError, TaskResult};
use crate::runtime::task::{
    self, create_task, downcast_value, AnyResult, CurrentTask, RecordId, StatusRecord, Task,
    TaskId, TaskOptions, TaskRef, WeakTaskRef,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct GroupFlags: u64 {
        const CANCELLED = 1 << 63;
        const DESTROYED = 1 << 62;
    }
}

const PENDING_MASK: u64 = (1 << 32) - 1;

/// What a group does with the results of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Results are queued in completion order for `next`.
    #[default]
    Accumulating,
    /// Values are dropped on arrival; only the first error is kept. A
    /// failing child never cancels its siblings.
    Discarding,
}

struct ReadyItem {
    task: TaskId,
    result: AnyResult,
}

/// Shared state of a task group.
pub(crate) struct GroupState {
    status: AtomicU64,
    ready: SegQueue<ReadyItem>,
    waiter: Mutex<Option<Waker>>,
    mode: GroupMode,
    first_error: Mutex<Option<TaskError>>,
    parent: WeakTaskRef,
    record: OnceCell<RecordId>,
}

impl GroupState {
    fn new(
        parent: WeakTaskRef,
        mode: GroupMode,
    ) -> Self {
        Self {
            status: AtomicU64::new(0),
            ready: SegQueue::new(),
            waiter: Mutex::new(None),
            mode,
            first_error: Mutex::new(None),
            parent,
            record: OnceCell::new(),
        }
    }

    #[inline]
    fn flags(&self) -> GroupFlags {
        GroupFlags::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn pending(&self) -> usize {
        (self.status.load(Ordering::Acquire) & PENDING_MASK) as usize
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.flags().contains(GroupFlags::CANCELLED)
    }

    #[inline]
    fn is_destroyed(&self) -> bool {
        self.flags().contains(GroupFlags::DESTROYED)
    }

    /// Set the cancelled bit. Returns whether this call set it.
    pub(crate) fn mark_cancelled(&self) -> bool {
        let prev = self
            .status
            .fetch_or(GroupFlags::CANCELLED.bits(), Ordering::AcqRel);
        prev & GroupFlags::CANCELLED.bits() == 0
    }

    /// Reserve a slot for a child about to be spawned. Fails once the group
    /// is cancelled, unless `unconditionally`.
    pub(crate) fn add_pending(
        &self,
        unconditionally: bool,
    ) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let cancelled = current & GroupFlags::CANCELLED.bits() != 0;
            if cancelled && !unconditionally {
                return false;
            }
            if current & PENDING_MASK == PENDING_MASK {
                fatal(FatalError::InvalidState(
                    "task group pending count overflow".to_string(),
                ));
            }
            match self.status.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Called by a child of this group when it completes.
    pub(crate) fn offer(
        &self,
        child: &TaskRef,
        result: AnyResult,
    ) {
        if let (Some(parent), Some(record)) = (self.parent.upgrade(), self.record.get()) {
            parent.detach_child(*record, child);
        }

        match self.mode {
            GroupMode::Accumulating => self.ready.push(ReadyItem {
                task: child.id(),
                result,
            }),
            GroupMode::Discarding => {
                if let Err(error) = result {
                    self.record_error(error);
                }
            }
        }

        let prev = self.status.fetch_sub(1, Ordering::AcqRel);
        if prev & PENDING_MASK == 0 {
            fatal(FatalError::InvalidState(format!(
                "{} offered to a task group with no pending children",
                child.id()
            )));
        }
        trace!(child = %child.id(), pending = (prev & PENDING_MASK) - 1, "child offered to group");

        let waiter = self.waiter.lock().take();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Keep `error` if it is the first one.
    fn record_error(
        &self,
        error: TaskError,
    ) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(error);
        }
    }

    fn register_waiter(
        &self,
        cx: &Context<'_>,
    ) {
        let mut waiter = self.waiter.lock();
        match waiter.as_ref() {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => *waiter = Some(cx.waker().clone()),
        }
    }

    fn clear_waiter(&self) {
        self.waiter.lock().take();
    }

    pub(crate) fn poll_next(
        &self,
        cx: &Context<'_>,
    ) -> Poll<Option<(TaskId, AnyResult)>> {
        if self.mode == GroupMode::Discarding {
            return Poll::Ready(None);
        }
        self.register_waiter(cx);
        if let Some(item) = self.ready.pop() {
            self.clear_waiter();
            return Poll::Ready(Some((item.task, item.result)));
        }
        if self.pending() == 0 {
            // An offer pushes before it decrements, so nothing can be in
            // flight any more.
            self.clear_waiter();
            return Poll::Ready(self.ready.pop().map(|item| (item.task, item.result)));
        }
        Poll::Pending
    }

    /// Drain everything; resolves with the first child error once nothing is
    /// pending.
    pub(crate) fn poll_wait_all(
        &self,
        cx: &Context<'_>,
    ) -> Poll<Option<TaskError>> {
        self.register_waiter(cx);
        self.drain_ready();
        if self.pending() != 0 {
            return Poll::Pending;
        }
        self.drain_ready();
        self.clear_waiter();
        Poll::Ready(self.first_error.lock().take())
    }

    fn drain_ready(&self) {
        while let Some(item) = self.ready.pop() {
            if let Err(error) = item.result {
                self.record_error(error);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending() == 0 && self.ready.is_empty()
    }

    pub(crate) fn cancel_all(&self) {
        let newly = self.mark_cancelled();
        let (Some(parent), Some(record)) = (self.parent.upgrade(), self.record.get()) else {
            return;
        };
        let children = parent.children_of(*record);
        debug!(
            parent = %parent.id(),
            children = children.len(),
            newly,
            "cancelling task group"
        );
        for child in &children {
            task::cancel(child);
        }
    }

    pub(crate) fn destroy(&self) {
        let pending = self.pending();
        if pending > 0 {
            fatal(FatalError::GroupNotEmpty { pending });
        }
        let prev = self
            .status
            .fetch_or(GroupFlags::DESTROYED.bits(), Ordering::AcqRel);
        if prev & GroupFlags::DESTROYED.bits() != 0 {
            fatal(FatalError::GroupDestroyed);
        }
        if let (Some(parent), Some(record)) = (self.parent.upgrade(), self.record.get()) {
            drop(parent.remove_status_record(*record));
            trace!(parent = %parent.id(), "task group destroyed");
        }
        while self.ready.pop().is_some() {}
    }

    fn ensure_alive(&self) {
        if self.is_destroyed() {
            fatal(FatalError::GroupDestroyed);
        }
    }
}

impl fmt::Debug for GroupState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("GroupState")
            .field("mode", &self.mode)
            .field("pending", &self.pending())
            .field("ready", &self.ready.len())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Handle to a task group whose children produce `T`.
///
/// Handles are cheap to clone; all clones refer to the same group. The
/// group must be [`destroy`](TaskGroup::destroy)ed once, after every child
/// has been awaited. [`with_task_group`] takes care of that.
pub struct TaskGroup<T> {
    state: Arc<GroupState>,
    parent: WeakTaskRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create an accumulating group owned by the running task.
    pub fn new(current: &CurrentTask) -> Self {
        Self::with_mode(current, GroupMode::Accumulating)
    }

    /// Create a group owned by the running task and register it on the
    /// task's status chain. A group created under a cancelled task starts
    /// cancelled.
    pub fn with_mode(
        current: &CurrentTask,
        mode: GroupMode,
    ) -> Self {
        let parent = current.task();
        let state = Arc::new(GroupState::new(parent.downgrade(), mode));
        {
            let mut chain = parent.lock_status();
            if chain.status().is_cancelled() {
                state.mark_cancelled();
            }
            let record = chain.push(StatusRecord::TaskGroup {
                group: state.clone(),
                first_child: None,
            });
            let _ = state.record.set(record);
        }
        debug!(parent = %parent.id(), ?mode, "task group created");
        Self {
            state,
            parent: parent.downgrade(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn mode(&self) -> GroupMode {
        self.state.mode
    }

    /// Children spawned but not yet offered.
    #[inline]
    pub fn pending(&self) -> usize {
        self.state.pending()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Nothing pending and nothing left to collect.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Reserve a slot for one more child, see [`TaskGroup::create_child`].
    pub fn add_pending(
        &self,
        unconditionally: bool,
    ) -> bool {
        self.state.ensure_alive();
        self.state.add_pending(unconditionally)
    }

    /// Create a member of this group without reserving, linking or starting
    /// it. Pair with [`TaskGroup::add_pending`], [`TaskGroup::attach_child`]
    /// and [`TaskRef::enqueue`], in that order.
    pub fn create_child<F, Fut>(
        &self,
        options: TaskOptions,
        body: F,
    ) -> Task<T>
    where
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let parent = self.parent_task();
        create_task(options.parent(&parent), Some(self.state.clone()), body)
    }

    /// Link a member created by [`TaskGroup::create_child`] under the group.
    pub fn attach_child(
        &self,
        child: &TaskRef,
    ) {
        let member = child
            .group()
            .is_some_and(|group| Arc::ptr_eq(group, &self.state));
        if !member {
            fatal(FatalError::InvalidState(format!(
                "{} is not a member of this task group",
                child.id()
            )));
        }
        let Some(record) = self.state.record.get() else {
            fatal(FatalError::GroupDestroyed);
        };
        self.parent_task().attach_child(*record, child);
    }

    /// Spawn a child into the group, even if the group is cancelled (the
    /// child then starts cancelled).
    pub fn spawn<F, Fut>(
        &self,
        options: TaskOptions,
        body: F,
    ) -> TaskId
    where
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        self.add_pending(true);
        self.start(options, body)
    }

    /// Spawn a child unless the group is cancelled.
    pub fn spawn_unless_cancelled<F, Fut>(
        &self,
        options: TaskOptions,
        body: F,
    ) -> Option<TaskId>
    where
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        if !self.add_pending(false) {
            return None;
        }
        Some(self.start(options, body))
    }

    fn start<F, Fut>(
        &self,
        options: TaskOptions,
        body: F,
    ) -> TaskId
    where
        F: FnOnce(CurrentTask) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let parent = self.parent_task();
        let executor = match options.executor.clone().or_else(|| parent.current_executor()) {
            Some(executor) => executor,
            None => fatal(FatalError::InvalidState(format!(
                "{} has no executor to start group children on",
                parent.id()
            ))),
        };
        let child = self.create_child(options, body);
        self.attach_child(child.task_ref());
        child.task_ref().enqueue(&executor);
        child.id()
    }

    /// The next completed child's outcome, in completion order. `None` once
    /// the group has nothing pending, and always `None` for discarding
    /// groups.
    pub fn next(&self) -> GroupNext<'_, T> {
        GroupNext {
            state: &self.state,
            _marker: PhantomData,
        }
    }

    /// Wait for every child. A child error wins over `body_error`.
    pub fn wait_all(
        &self,
        body_error: Option<TaskError>,
    ) -> GroupWaitAll<'_> {
        GroupWaitAll {
            state: &self.state,
            body_error,
        }
    }

    /// Cancel the group and every child currently in it.
    pub fn cancel_all(&self) {
        self.state.cancel_all();
    }

    /// Remove the group from its parent. Fatal if children are pending.
    pub fn destroy(self) {
        self.state.destroy();
    }

    fn parent_task(&self) -> TaskRef {
        match self.parent.upgrade() {
            Some(parent) => parent,
            None => fatal(FatalError::InvalidState(
                "task group used after its parent task was released".to_string(),
            )),
        }
    }
}

impl<T> Clone for TaskGroup<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            parent: self.parent.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TaskGroup<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("state", &self.state)
            .finish()
    }
}

/// Future returned by [`TaskGroup::next`].
#[must_use = "futures do nothing unless awaited"]
pub struct GroupNext<'a, T> {
    state: &'a GroupState,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Future for GroupNext<'_, T> {
    type Output = Option<TaskResult<T>>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        self.state
            .poll_next(cx)
            .map(|item| item.map(|(_, result)| result.and_then(downcast_value::<T>)))
    }
}

/// Future returned by [`TaskGroup::wait_all`].
#[must_use = "futures do nothing unless awaited"]
pub struct GroupWaitAll<'a> {
    state: &'a GroupState,
    body_error: Option<TaskError>,
}

impl Future for GroupWaitAll<'_> {
    type Output = TaskResult<()>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<TaskResult<()>> {
        let this = self.get_mut();
        match this.state.poll_wait_all(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(child_error)) => Poll::Ready(Err(child_error)),
            Poll::Ready(None) => Poll::Ready(match this.body_error.take() {
                Some(body_error) => Err(body_error),
                None => Ok(()),
            }),
        }
    }
}

/// Run `body` with a fresh group and tear the group down afterwards.
///
/// If the body fails, the group is cancelled before waiting for the
/// remaining children. Accumulating groups surface the body's outcome;
/// discarding groups follow the [`TaskGroup::wait_all`] rule, so a child
/// error wins.
pub async fn with_task_group<T, R, F, Fut>(
    current: &CurrentTask,
    mode: GroupMode,
    body: F,
) -> TaskResult<R>
where
    T: Send + 'static,
    F: FnOnce(TaskGroup<T>) -> Fut,
    Fut: Future<Output = TaskResult<R>>,
{
    let group = TaskGroup::with_mode(current, mode);
    let result = body(group.clone()).await;

    let outcome = match (mode, result) {
        (GroupMode::Accumulating, Ok(value)) => {
            let _ = group.wait_all(None).await;
            Ok(value)
        }
        (GroupMode::Accumulating, Err(error)) => {
            group.cancel_all();
            let _ = group.wait_all(None).await;
            Err(error)
        }
        (GroupMode::Discarding, Ok(value)) => group.wait_all(None).await.map(|()| value),
        (GroupMode::Discarding, Err(error)) => {
            group.cancel_all();
            Err(group
                .wait_all(Some(error.clone()))
                .await
                .err()
                .unwrap_or(error))
        }
    };

    group.destroy();
    outcome
}
