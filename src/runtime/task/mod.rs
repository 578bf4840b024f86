//! Tasks
//!
//! A task is a heap object wrapping a type-erased body future. It is driven
//! by jobs submitted to an [`Executor`]; every transition of its lifecycle
//! (`Suspended -> Enqueued -> Running -> ... -> Completed`) is a CAS on the
//! status word in [`state`]. Structured work in flight below a task is
//! tracked by its status-record chain, see [`status`].
//!
//! The body receives a [`CurrentTask`], an unowned handle to its own task,
//! which it uses to check cancellation or to start structured children.

mod options;
mod state;
pub mod status;

pub use options::TaskOptions;
pub use state::{Status, StatusFlags, TaskPriority, TaskState};
pub use status::{
    add_child_task, remove_child_task, with_cancellation_handler, CancellationHandler,
    EscalationHandler, RecordId, RecordKind,
};

pub(crate) use status::{RemoveError, StatusChain, StatusRecord};

use std::alloc::Layout;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace, warn};

use self::state::StatusCell;
use crate::runtime::error::{fatal, FatalError, TaskError, TaskResult};
use crate::runtime::group::GroupState;
use crate::runtime::heap::{self, HeapHeader, HeapRef, UnownedRef, WeakRef};
use crate::runtime::memory::TaskAllocator;
use crate::runtime::scheduler::{Executor, Job};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

pub(crate) type AnyValue = Box<dyn Any + Send>;
pub(crate) type AnyResult = Result<AnyValue, TaskError>;
type BoxFuture = Pin<Box<dyn Future<Output = AnyResult> + Send>>;

enum Outcome {
    Pending,
    Ready(AnyResult),
    Taken,
}

struct Completion {
    outcome: Outcome,
    waiters: Vec<Waker>,
}

/// Present on tasks created with a parent.
pub(crate) struct ChildFragment {
    parent: TaskId,
    group: Option<Arc<GroupState>>,
}

pub(crate) struct TaskInner {
    id: TaskId,
    name: Option<String>,
    base_priority: TaskPriority,
    status: StatusCell,
    /// Guarded by the status lock.
    records: UnsafeCell<StatusChain>,
    fragment: Option<ChildFragment>,
    /// Next child under the same parent record. Guarded by the parent's
    /// status lock.
    sibling: UnsafeCell<Option<TaskRef>>,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    completion: Mutex<Completion>,
    completed: Condvar,
    /// Must be declared before `allocator`: the body may own buffers carved
    /// from the allocator and has to be dropped first.
    future: Mutex<Option<BoxFuture>>,
    allocator: TaskAllocator,
}

// Safety: the two `UnsafeCell`s are only accessed under a status lock.
unsafe impl Send for TaskInner {}
// Safety: as above
unsafe impl Sync for TaskInner {}

/// Strong reference to a task.
#[derive(Clone)]
pub struct TaskRef(HeapRef<TaskInner>);

/// Weak reference to a task.
#[derive(Clone)]
pub struct WeakTaskRef(WeakRef<TaskInner>);

/// The handle a task body receives to talk about its own task.
///
/// It does not keep the task alive: the body is owned by the task, so the
/// task necessarily outlives every use of it from inside the body.
#[derive(Clone)]
pub struct CurrentTask(UnownedRef<TaskInner>);

/// Typed handle to a task producing `T`.
pub struct Task<T> {
    task: TaskRef,
    _marker: PhantomData<fn() -> T>,
}

/// Create a task running `body`. The task is not enqueued.
pub fn create<T, F, Fut>(
    options: TaskOptions,
    body: F,
) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(CurrentTask) -> Fut,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    create_task(options, None, body)
}

/// Create a structured child of `parent` and register it under a fresh
/// child-task record. The caller owns the returned record and must remove it
/// once the child is done with.
pub fn create_child_task<T, F, Fut>(
    parent: &TaskRef,
    options: TaskOptions,
    body: F,
) -> (Task<T>, RecordId)
where
    T: Send + 'static,
    F: FnOnce(CurrentTask) -> Fut,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    let child = create_task(options.parent(parent), None, body);
    let record = parent.add_status_record(StatusRecord::ChildTask { first_child: None });
    parent.attach_child(record, child.task_ref());
    (child, record)
}

pub(crate) fn create_task<T, F, Fut>(
    options: TaskOptions,
    group: Option<Arc<GroupState>>,
    body: F,
) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(CurrentTask) -> Fut,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    let priority = options.initial_priority();
    let mut initial = Status::new(priority);
    let inherited_cancel = options.parent.as_ref().is_some_and(TaskRef::is_cancelled)
        || group.as_ref().is_some_and(|group| group.is_cancelled());
    initial.set(StatusFlags::CANCELLED, inherited_cancel);

    let fragment = options.parent.as_ref().map(|parent| ChildFragment {
        parent: parent.id(),
        group,
    });

    let task = TaskRef(HeapRef::new(TaskInner {
        id: TaskId::next(),
        name: options.name,
        base_priority: priority,
        status: StatusCell::new(initial),
        records: UnsafeCell::new(StatusChain::default()),
        fragment,
        sibling: UnsafeCell::new(None),
        executor: Mutex::new(options.executor),
        completion: Mutex::new(Completion {
            outcome: Outcome::Pending,
            waiters: Vec::new(),
        }),
        completed: Condvar::new(),
        future: Mutex::new(None),
        allocator: TaskAllocator::with_slab_size(options.slab_size),
    }));

    let body = body(CurrentTask(HeapRef::unowned(&task.0)));
    let erased: BoxFuture = Box::pin(async move {
        body.await.map(|value| Box::new(value) as AnyValue)
    });
    *task.0.future.lock() = Some(erased);

    debug!(
        task = %task.id(),
        name = task.name().unwrap_or(""),
        %priority,
        parent = ?task.parent_id(),
        cancelled = inherited_cancel,
        "task created"
    );
    Task::new(task)
}

/// Request cancellation of `task` and, transitively, of every structured
/// child below it. Idempotent.
pub fn cancel(task: &TaskRef) {
    let mut worklist: SmallVec<[TaskRef; 8]> = smallvec![task.clone()];
    let mut handlers: SmallVec<[CancellationHandler; 4]> = SmallVec::new();

    while let Some(task) = worklist.pop() {
        let locked = task.lock_status_if(|status| {
            if status.is_cancelled() {
                return false;
            }
            status.set(StatusFlags::CANCELLED, true);
            true
        });
        let Some(mut chain) = locked else {
            continue;
        };

        for id in chain.ids() {
            match chain.get_mut(id) {
                Some(StatusRecord::CancellationNotification { handler, fired }) if !*fired => {
                    *fired = true;
                    handlers.push(handler.clone());
                }
                Some(StatusRecord::TaskGroup { group, .. }) => {
                    group.mark_cancelled();
                }
                _ => {}
            }
        }
        worklist.extend(chain.all_children());
        drop(chain);

        trace!(task = %task.id(), handlers = handlers.len(), "task cancelled");
        for handler in handlers.drain(..) {
            handler();
        }
    }
}

/// Raise `task` (and its structured children) to at least `priority`.
/// Returns the task's effective priority afterwards. Never lowers anything.
pub fn escalate(
    task: &TaskRef,
    priority: TaskPriority,
) -> TaskPriority {
    let mut effective = None;
    let mut worklist: SmallVec<[TaskRef; 8]> = smallvec![task.clone()];
    let mut handlers: SmallVec<[EscalationHandler; 4]> = SmallVec::new();

    while let Some(task) = worklist.pop() {
        let raised = task.0.status.transition(|status| {
            if status.priority() >= priority || status.is_completed() {
                return Err(status.priority());
            }
            status.set_priority(priority);
            status.set(StatusFlags::ESCALATED, true);
            Ok(priority)
        });
        let current = match raised {
            Ok(priority) | Err(priority) => priority,
        };
        effective.get_or_insert(current);
        if raised.is_err() {
            continue;
        }

        {
            let chain = task.lock_status();
            for (_, record) in chain.iter() {
                if let StatusRecord::EscalationNotification { handler } = record {
                    handlers.push(handler.clone());
                }
            }
            worklist.extend(chain.all_children());
        }

        if task.status().contains(StatusFlags::ENQUEUED) {
            if let Some(executor) = task.resume_executor() {
                executor.escalate(&task, priority);
            }
        }

        trace!(task = %task.id(), %priority, "task escalated");
        for handler in handlers.drain(..) {
            handler(priority);
        }
    }

    effective.unwrap_or(priority)
}

// === impl TaskRef ===

impl TaskRef {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Snapshot of the status word.
    #[inline]
    pub fn status(&self) -> Status {
        self.0.status.load()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.status().state()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.status().is_cancelled()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    #[inline]
    pub fn base_priority(&self) -> TaskPriority {
        self.0.base_priority
    }

    /// Base priority, or the escalated priority if higher.
    #[inline]
    pub fn current_priority(&self) -> TaskPriority {
        self.status().priority()
    }

    #[inline]
    pub fn parent_id(&self) -> Option<TaskId> {
        self.0.fragment.as_ref().map(|fragment| fragment.parent)
    }

    #[inline]
    pub fn is_group_child(&self) -> bool {
        self.group().is_some()
    }

    #[inline]
    pub fn ptr_eq(
        a: &TaskRef,
        b: &TaskRef,
    ) -> bool {
        HeapRef::ptr_eq(&a.0, &b.0)
    }

    pub fn downgrade(&self) -> WeakTaskRef {
        WeakTaskRef(HeapRef::downgrade(&self.0))
    }

    /// Number of strong references, for diagnostics.
    pub fn ref_count(&self) -> usize {
        HeapRef::strong_count(&self.0)
    }

    pub fn cancel(&self) {
        cancel(self)
    }

    pub fn escalate(
        &self,
        priority: TaskPriority,
    ) -> TaskPriority {
        escalate(self, priority)
    }

    /// Submit the task to `executor`. Does nothing if it is already queued
    /// or finished; a running task is re-queued after its current poll.
    pub fn enqueue(
        &self,
        executor: &Arc<dyn Executor>,
    ) {
        *self.0.executor.lock() = Some(executor.clone());
        self.wake_by_ref();
    }

    /// Poll the body once on the current thread, as if `executor` ran it.
    pub fn run(
        &self,
        executor: &Arc<dyn Executor>,
    ) {
        let started = self.0.status.transition(|status| {
            if status.is_completed() || status.contains(StatusFlags::RUNNING) {
                return false;
            }
            status.set(StatusFlags::ENQUEUED | StatusFlags::NOTIFIED, false);
            status.set(StatusFlags::RUNNING, true);
            true
        });
        if !started {
            trace!(task = %self.id(), "skipping run of busy or finished task");
            return;
        }

        *self.0.executor.lock() = Some(executor.clone());
        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);

        let polled = {
            let mut future = self.0.future.lock();
            let Some(body) = future.as_mut() else {
                fatal(FatalError::InvalidState(format!(
                    "{} is running without a body",
                    self.id()
                )));
            };
            panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
        };

        let result = match polled {
            Ok(Poll::Pending) => {
                self.suspend();
                return;
            }
            Ok(Poll::Ready(result)) => result,
            Err(payload) => {
                let error = TaskError::from_panic(payload);
                warn!(task = %self.id(), %error, "task body panicked");
                Err(error)
            }
        };

        let body = self.0.future.lock().take();
        drop(body);
        self.complete(result);
    }

    /// Future resolving once the task has completed.
    pub fn wait(&self) -> FutureWait<'_> {
        FutureWait {
            task: self,
            escalate_to: None,
        }
    }

    /// Like [`TaskRef::wait`], escalating the task to the waiter's priority
    /// first.
    pub fn wait_escalating(
        &self,
        priority: TaskPriority,
    ) -> FutureWait<'_> {
        FutureWait {
            task: self,
            escalate_to: Some(priority),
        }
    }

    /// Block the calling thread until the task has completed.
    pub fn wait_blocking(&self) {
        let mut completion = self.0.completion.lock();
        while matches!(completion.outcome, Outcome::Pending) {
            self.0.completed.wait(&mut completion);
        }
    }

    /// Carve scratch memory out of the task's slab allocator.
    pub fn alloc(
        &self,
        layout: Layout,
    ) -> NonNull<u8> {
        self.0.allocator.alloc(layout)
    }

    /// Return memory obtained from [`TaskRef::alloc`].
    pub fn dealloc(
        &self,
        ptr: NonNull<u8>,
    ) {
        self.0.allocator.dealloc(ptr)
    }

    #[inline]
    pub fn allocator(&self) -> &TaskAllocator {
        &self.0.allocator
    }

    // --- status records ---

    /// Install a cancellation handler. If the task is already cancelled the
    /// handler runs right away, and never again.
    pub fn add_cancellation_handler<H>(
        &self,
        handler: H,
    ) -> RecordId
    where
        H: Fn() + Send + Sync + 'static,
    {
        let handler: CancellationHandler = Arc::new(handler);
        let (record, cancelled) = {
            let mut chain = self.lock_status();
            let cancelled = chain.status().is_cancelled();
            let record = chain.push(StatusRecord::CancellationNotification {
                handler: handler.clone(),
                fired: cancelled,
            });
            (record, cancelled)
        };
        if cancelled {
            handler();
        }
        record
    }

    pub fn remove_cancellation_handler(
        &self,
        record: RecordId,
    ) {
        self.remove_record_of_kind(record, RecordKind::CancellationNotification);
    }

    pub fn add_escalation_handler<H>(
        &self,
        handler: H,
    ) -> RecordId
    where
        H: Fn(TaskPriority) + Send + Sync + 'static,
    {
        self.add_status_record(StatusRecord::EscalationNotification {
            handler: Arc::new(handler),
        })
    }

    pub fn remove_escalation_handler(
        &self,
        record: RecordId,
    ) {
        self.remove_record_of_kind(record, RecordKind::EscalationNotification);
    }

    /// Prefer `executor` whenever the task is resumed, until popped.
    pub fn push_executor_preference(
        &self,
        executor: Arc<dyn Executor>,
    ) -> RecordId {
        self.add_status_record(StatusRecord::ExecutorPreference { executor })
    }

    pub fn pop_executor_preference(
        &self,
        record: RecordId,
    ) {
        self.remove_record_of_kind(record, RecordKind::ExecutorPreference);
    }

    /// Remove a child-task record created by [`create_child_task`].
    pub fn remove_child_record(
        &self,
        record: RecordId,
    ) {
        self.remove_record_of_kind(record, RecordKind::ChildTask);
    }

    /// Kinds of the installed records, most recent first.
    pub fn record_kinds(&self) -> Vec<RecordKind> {
        self.lock_status()
            .iter()
            .map(|(_, record)| record.kind())
            .collect()
    }

    pub(crate) fn add_status_record(
        &self,
        record: StatusRecord,
    ) -> RecordId {
        self.lock_status().push(record)
    }

    pub(crate) fn remove_status_record(
        &self,
        record: RecordId,
    ) -> StatusRecord {
        let removed = self.lock_status().remove(record);
        match removed {
            Ok(removed) => removed,
            Err(RemoveError::NotFound) => fatal(FatalError::RecordNotFound {
                task: self.id().as_u64(),
                record: record.to_string(),
            }),
            Err(RemoveError::NotHead(kind)) => fatal(FatalError::MismatchedPop {
                task: self.id().as_u64(),
                record: record.to_string(),
                kind: kind.as_str(),
            }),
        }
    }

    fn remove_record_of_kind(
        &self,
        record: RecordId,
        kind: RecordKind,
    ) {
        {
            let chain = self.lock_status();
            match chain.get(record) {
                Some(found) if found.kind() == kind => {}
                Some(found) => fatal(FatalError::MismatchedPop {
                    task: self.id().as_u64(),
                    record: record.to_string(),
                    kind: found.kind().as_str(),
                }),
                None => fatal(FatalError::RecordNotFound {
                    task: self.id().as_u64(),
                    record: record.to_string(),
                }),
            }
        }
        drop(self.remove_status_record(record));
    }

    /// Link `child` under `record`. A child attached to an already
    /// cancelled parent, or to a group cancelled since the child was
    /// created, is cancelled on the spot.
    pub(crate) fn attach_child(
        &self,
        record: RecordId,
        child: &TaskRef,
    ) {
        let cancelled = {
            let mut chain = self.lock_status();
            if !chain.add_child(record, child.clone()) {
                fatal(FatalError::RecordNotFound {
                    task: self.id().as_u64(),
                    record: record.to_string(),
                });
            }
            // `cancel_all` sets the group bit before it walks the children
            // under this lock, so one of the two sides sees the child.
            chain.status().is_cancelled()
                || child.group().is_some_and(|group| group.is_cancelled())
        };
        if cancelled {
            cancel(child);
        }
    }

    pub(crate) fn detach_child(
        &self,
        record: RecordId,
        child: &TaskRef,
    ) {
        let removed = self.lock_status().remove_child(record, child);
        if removed.is_none() {
            fatal(FatalError::ChildNotLinked {
                child: child.id().as_u64(),
                record: record.to_string(),
            });
        }
    }

    pub(crate) fn children_of(
        &self,
        record: RecordId,
    ) -> SmallVec<[TaskRef; 8]> {
        self.lock_status().children_of(record)
    }

    // --- internals ---

    pub(crate) fn lock_status(&self) -> StatusGuard<'_> {
        let status = self.0.status.lock();
        StatusGuard {
            task: &self.0,
            status,
        }
    }

    fn lock_status_if(
        &self,
        update: impl FnMut(&mut Status) -> bool,
    ) -> Option<StatusGuard<'_>> {
        let status = self.0.status.lock_if(update)?;
        Some(StatusGuard {
            task: &self.0,
            status,
        })
    }

    /// Non-blocking variant for observers that must never wait.
    pub(crate) fn try_lock_status(&self) -> Option<StatusGuard<'_>> {
        if !self.0.status.try_lock() {
            return None;
        }
        Some(StatusGuard {
            task: &self.0,
            status: self.0.status.load(),
        })
    }

    pub(crate) fn group(&self) -> Option<&Arc<GroupState>> {
        self.0.fragment.as_ref()?.group.as_ref()
    }

    pub(crate) fn sibling_link(&self) -> *mut Option<TaskRef> {
        self.0.sibling.get()
    }

    /// The executor the task is currently running on, or last ran on.
    pub fn current_executor(&self) -> Option<Arc<dyn Executor>> {
        self.0.executor.lock().clone()
    }

    /// Where to resume: a preference record wins over the last executor.
    pub(crate) fn resume_executor(&self) -> Option<Arc<dyn Executor>> {
        if self.status().contains(StatusFlags::HAS_RECORDS) {
            let chain = self.lock_status();
            let preferred = chain.iter().find_map(|(_, record)| match record {
                StatusRecord::ExecutorPreference { executor } => Some(executor.clone()),
                _ => None,
            });
            if preferred.is_some() {
                return preferred;
            }
        }
        self.current_executor()
    }

    /// Take the completed outcome, leaving `Consumed` behind.
    pub(crate) fn take_result(&self) -> Option<AnyResult> {
        let mut completion = self.0.completion.lock();
        match mem::replace(&mut completion.outcome, Outcome::Taken) {
            Outcome::Ready(result) => Some(result),
            Outcome::Pending => {
                completion.outcome = Outcome::Pending;
                None
            }
            Outcome::Taken => None,
        }
    }

    pub(crate) fn take_typed<T: 'static>(&self) -> TaskResult<T> {
        match self.take_result() {
            Some(Ok(value)) => downcast_value(value),
            Some(Err(error)) => Err(error),
            None => Err(TaskError::Consumed),
        }
    }

    pub(crate) fn wake_by_ref(&self) {
        let submit = self.0.status.transition(|status| {
            if status.is_completed() || status.contains(StatusFlags::ENQUEUED) {
                return false;
            }
            if status.contains(StatusFlags::RUNNING) {
                status.set(StatusFlags::NOTIFIED, true);
                return false;
            }
            status.set(StatusFlags::ENQUEUED, true);
            true
        });
        if submit {
            self.submit();
        }
    }

    fn submit(&self) {
        match self.resume_executor() {
            Some(executor) => executor.enqueue(Job::from_task(self.clone())),
            None => {
                warn!(task = %self.id(), "woken task has no executor, leaving it suspended");
                self.0.status.transition(|status| status.set(StatusFlags::ENQUEUED, false));
            }
        }
    }

    fn suspend(&self) {
        let reschedule = self.0.status.transition(|status| {
            status.set(StatusFlags::RUNNING, false);
            if status.contains(StatusFlags::NOTIFIED) {
                status.set(StatusFlags::NOTIFIED, false);
                status.set(StatusFlags::ENQUEUED, true);
                true
            } else {
                false
            }
        });
        if reschedule {
            self.submit();
        }
    }

    fn complete(
        &self,
        result: AnyResult,
    ) {
        self.0.status.transition(|status| {
            status.set(StatusFlags::RUNNING | StatusFlags::NOTIFIED, false);
            status.set(StatusFlags::COMPLETED, true);
        });
        debug!(task = %self.id(), ok = result.is_ok(), "task completed");

        let outcome = match self.group() {
            Some(group) => {
                group.offer(self, result);
                Outcome::Taken
            }
            None => Outcome::Ready(result),
        };

        let waiters = {
            let mut completion = self.0.completion.lock();
            completion.outcome = outcome;
            mem::take(&mut completion.waiters)
        };
        self.0.completed.notify_all();
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn waker(&self) -> Waker {
        let raw = HeapRef::into_raw(self.0.clone());
        // Safety: the vtable functions treat the data pointer as the strong
        // reference we just leaked into it.
        unsafe { Waker::from_raw(RawWaker::new(raw.as_ptr() as *const (), &WAKER_VTABLE)) }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) fn downcast_value<T: 'static>(value: AnyValue) -> TaskResult<T> {
    match value.downcast::<T>() {
        Ok(value) => Ok(*value),
        Err(_) => fatal(FatalError::InvalidState(format!(
            "task result is not a `{}`",
            std::any::type_name::<T>()
        ))),
    }
}

// === waker ===

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_waker, wake_waker_by_ref, drop_waker);

unsafe fn header(ptr: *const ()) -> NonNull<HeapHeader> {
    // Safety: waker data pointers always come from `TaskRef::waker`
    unsafe { NonNull::new_unchecked(ptr as *mut HeapHeader) }
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    // Safety: the waker being cloned owns a strong reference
    unsafe { heap::retain(header(ptr)) };
    RawWaker::new(ptr, &WAKER_VTABLE)
}

unsafe fn wake_waker(ptr: *const ()) {
    // Safety: consumes the waker's strong reference
    let task = TaskRef(unsafe { HeapRef::from_raw(header(ptr)) });
    task.wake_by_ref();
}

unsafe fn wake_waker_by_ref(ptr: *const ()) {
    // Safety: borrows the waker's strong reference without consuming it
    let task = ManuallyDrop::new(TaskRef(unsafe { HeapRef::from_raw(header(ptr)) }));
    task.wake_by_ref();
}

unsafe fn drop_waker(ptr: *const ()) {
    // Safety: releases the waker's strong reference
    unsafe { heap::release(header(ptr)) }
}

// === impl StatusGuard ===

/// Exclusive access to a task's status-record chain. Unlocks on drop.
pub(crate) struct StatusGuard<'a> {
    task: &'a TaskInner,
    status: Status,
}

impl StatusGuard<'_> {
    /// The status word as it was when the lock was taken.
    #[inline]
    pub(crate) fn status(&self) -> Status {
        self.status
    }
}

impl Deref for StatusGuard<'_> {
    type Target = StatusChain;

    fn deref(&self) -> &StatusChain {
        // Safety: we hold the status lock
        unsafe { &*self.task.records.get() }
    }
}

impl DerefMut for StatusGuard<'_> {
    fn deref_mut(&mut self) -> &mut StatusChain {
        // Safety: we hold the status lock
        unsafe { &mut *self.task.records.get() }
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        let has_records = !self.is_empty();
        self.task.status.unlock(has_records);
    }
}

// === impl WeakTaskRef ===

impl WeakTaskRef {
    pub fn upgrade(&self) -> Option<TaskRef> {
        self.0.upgrade().map(TaskRef)
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

impl fmt::Debug for WeakTaskRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("WeakTaskRef").field(&self.0).finish()
    }
}

// === impl CurrentTask ===

impl CurrentTask {
    /// A strong reference to the running task.
    pub fn task(&self) -> TaskRef {
        TaskRef(self.0.load())
    }

    pub fn id(&self) -> TaskId {
        self.task().id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task().is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once cancellation was requested.
    pub fn check_cancellation(&self) -> TaskResult<()> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn priority(&self) -> TaskPriority {
        self.task().current_priority()
    }

    /// Continue on `executor` from the next suspension point on.
    pub fn switch_to(
        &self,
        executor: Arc<dyn Executor>,
    ) -> SwitchTo {
        SwitchTo {
            task: self.task(),
            executor: Some(executor),
        }
    }

    pub(crate) fn weak(&self) -> WeakTaskRef {
        self.task().downgrade()
    }
}

impl fmt::Debug for CurrentTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("CurrentTask").field(&self.0).finish()
    }
}

/// Future returned by [`CurrentTask::switch_to`].
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchTo {
    task: TaskRef,
    executor: Option<Arc<dyn Executor>>,
}

impl Future for SwitchTo {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let this = self.get_mut();
        match this.executor.take() {
            Some(executor) => {
                trace!(task = %this.task.id(), executor = executor.name(), "switching executor");
                *this.task.0.executor.lock() = Some(executor);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// Future returned by [`TaskRef::wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct FutureWait<'a> {
    task: &'a TaskRef,
    escalate_to: Option<TaskPriority>,
}

impl Future for FutureWait<'_> {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let this = self.get_mut();
        if let Some(priority) = this.escalate_to.take() {
            this.task.escalate(priority);
        }
        let mut completion = this.task.0.completion.lock();
        if !matches!(completion.outcome, Outcome::Pending) {
            return Poll::Ready(());
        }
        if !completion.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            completion.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// === impl Task ===

impl<T: Send + 'static> Task<T> {
    fn new(task: TaskRef) -> Self {
        Self {
            task,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn task_ref(&self) -> &TaskRef {
        &self.task
    }

    #[inline]
    pub fn into_ref(self) -> TaskRef {
        self.task
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn cancel(&self) {
        self.task.cancel()
    }

    /// Wait for the task and take its outcome.
    pub async fn value(self) -> TaskResult<T> {
        self.task.wait().await;
        self.task.take_typed()
    }

    /// Block the calling thread until the task finishes and take its outcome.
    pub fn wait_blocking(self) -> TaskResult<T> {
        self.task.wait_blocking();
        self.task.take_typed()
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("task", &self.task)
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests;
