//! Status records
//!
//! A task carries a chain of status records describing the structured work
//! it currently has in flight: child tasks, task groups, cancellation and
//! escalation handlers, and executor preferences. Records live in a small
//! arena owned by the task and are addressed by generation-checked
//! [`RecordId`] handles; the chain itself is the list of `parent` links
//! starting at the most recently pushed record.
//!
//! The chain is only ever touched while the owning task's status lock is
//! held, see [`StatusGuard`](super::StatusGuard).

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use super::state::TaskPriority;
use super::TaskRef;
use crate::runtime::group::GroupState;
use crate::runtime::scheduler::Executor;

/// Handle to a status record installed on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    index: u32,
    generation: u32,
}

impl fmt::Display for RecordId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "record#{}.{}", self.index, self.generation)
    }
}

/// Invoked once when the task is cancelled.
pub type CancellationHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked with the new priority whenever the task is escalated.
pub type EscalationHandler = Arc<dyn Fn(TaskPriority) + Send + Sync>;

/// Kind of a status record, for diagnostics and reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    ChildTask,
    TaskGroup,
    CancellationNotification,
    EscalationNotification,
    ExecutorPreference,
}

impl RecordKind {
    /// Child-carrying records may be removed out of order.
    #[inline]
    pub fn holds_children(self) -> bool {
        matches!(self, RecordKind::ChildTask | RecordKind::TaskGroup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::ChildTask => "child-task",
            RecordKind::TaskGroup => "task-group",
            RecordKind::CancellationNotification => "cancellation-notification",
            RecordKind::EscalationNotification => "escalation-notification",
            RecordKind::ExecutorPreference => "executor-preference",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum StatusRecord {
    /// Structured children. Further children hang off each child's sibling
    /// link.
    ChildTask { first_child: Option<TaskRef> },
    /// A task group owned by this task, and the group's live children.
    TaskGroup {
        group: Arc<GroupState>,
        first_child: Option<TaskRef>,
    },
    CancellationNotification {
        handler: CancellationHandler,
        fired: bool,
    },
    EscalationNotification { handler: EscalationHandler },
    ExecutorPreference { executor: Arc<dyn Executor> },
}

impl StatusRecord {
    pub(crate) fn kind(&self) -> RecordKind {
        match self {
            StatusRecord::ChildTask { .. } => RecordKind::ChildTask,
            StatusRecord::TaskGroup { .. } => RecordKind::TaskGroup,
            StatusRecord::CancellationNotification { .. } => RecordKind::CancellationNotification,
            StatusRecord::EscalationNotification { .. } => RecordKind::EscalationNotification,
            StatusRecord::ExecutorPreference { .. } => RecordKind::ExecutorPreference,
        }
    }

    fn first_child(&self) -> Option<&TaskRef> {
        match self {
            StatusRecord::ChildTask { first_child } | StatusRecord::TaskGroup { first_child, .. } => {
                first_child.as_ref()
            }
            _ => None,
        }
    }

    fn first_child_slot(&mut self) -> Option<&mut Option<TaskRef>> {
        match self {
            StatusRecord::ChildTask { first_child } | StatusRecord::TaskGroup { first_child, .. } => {
                Some(first_child)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for StatusRecord {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("StatusRecord")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

struct Entry {
    record: StatusRecord,
    parent: Option<u32>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Why a record could not be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveError {
    NotFound,
    NotHead(RecordKind),
}

/// Arena-backed record chain of one task.
#[derive(Default)]
pub(crate) struct StatusChain {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    len: usize,
}

impl StatusChain {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn head(&self) -> Option<RecordId> {
        self.head.map(|index| self.id_at(index))
    }

    /// Push `record` as the new head.
    pub(crate) fn push(
        &mut self,
        record: StatusRecord,
    ) -> RecordId {
        let entry = Entry {
            record,
            parent: self.head,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.head = Some(index);
        self.len += 1;
        self.id_at(index)
    }

    /// Remove a record. Only the head may go, unless the record carries
    /// children, in which case it is spliced out of the middle.
    pub(crate) fn remove(
        &mut self,
        id: RecordId,
    ) -> Result<StatusRecord, RemoveError> {
        let entry = self.entry(id).ok_or(RemoveError::NotFound)?;
        let kind = entry.record.kind();
        let parent = entry.parent;

        if self.head == Some(id.index) {
            self.head = parent;
        } else if kind.holds_children() {
            self.splice_parent(id.index, parent);
        } else {
            return Err(RemoveError::NotHead(kind));
        }

        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take().ok_or(RemoveError::NotFound)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Ok(entry.record)
    }

    pub(crate) fn get(
        &self,
        id: RecordId,
    ) -> Option<&StatusRecord> {
        self.entry(id).map(|entry| &entry.record)
    }

    pub(crate) fn get_mut(
        &mut self,
        id: RecordId,
    ) -> Option<&mut StatusRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().map(|entry| &mut entry.record)
    }

    /// Records from the most recent to the oldest.
    pub(crate) fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.head,
        }
    }

    /// Handles of all records, most recent first.
    pub(crate) fn ids(&self) -> SmallVec<[RecordId; 8]> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Link `child` at the front of the child list of `record`.
    ///
    /// Returns `false` if `record` does not exist or carries no children.
    pub(crate) fn add_child(
        &mut self,
        record: RecordId,
        child: TaskRef,
    ) -> bool {
        let Some(first) = self.get_mut(record).and_then(StatusRecord::first_child_slot) else {
            return false;
        };
        // Safety: the sibling link of a child is only accessed under its
        // parent's status lock, which the `&mut self` borrow proves we hold.
        unsafe { *child.sibling_link() = first.take() };
        *first = Some(child);
        true
    }

    /// Unlink `child` from the child list of `record`.
    pub(crate) fn remove_child(
        &mut self,
        record: RecordId,
        child: &TaskRef,
    ) -> Option<TaskRef> {
        let first = self.get_mut(record).and_then(StatusRecord::first_child_slot)?;
        let mut link: *mut Option<TaskRef> = first;
        loop {
            // Safety: `link` is either the record's own slot or the sibling
            // link of a child on this list; both are covered by the lock.
            let slot = unsafe { &mut *link };
            let next = match slot.as_ref() {
                None => return None,
                Some(task) if TaskRef::ptr_eq(task, child) => None,
                Some(task) => Some(task.sibling_link()),
            };
            match next {
                Some(next) => link = next,
                None => {
                    let removed = slot.take()?;
                    // Safety: as above
                    *slot = unsafe { (*removed.sibling_link()).take() };
                    return Some(removed);
                }
            }
        }
    }

    /// Children linked under `record`.
    pub(crate) fn children_of(
        &self,
        record: RecordId,
    ) -> SmallVec<[TaskRef; 8]> {
        self.get(record)
            .map(|record| siblings(record.first_child()).cloned().collect())
            .unwrap_or_default()
    }

    /// Children linked under any record of this chain.
    pub(crate) fn all_children(&self) -> SmallVec<[TaskRef; 8]> {
        self.iter()
            .flat_map(|(_, record)| siblings(record.first_child()))
            .cloned()
            .collect()
    }

    fn splice_parent(
        &mut self,
        index: u32,
        new_parent: Option<u32>,
    ) {
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let Some(entry) = self.slots[current as usize].entry.as_mut() else {
                return;
            };
            if entry.parent == Some(index) {
                entry.parent = new_parent;
                return;
            }
            cursor = entry.parent;
        }
    }

    fn entry(
        &self,
        id: RecordId,
    ) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn id_at(
        &self,
        index: u32,
    ) -> RecordId {
        RecordId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }
}

/// Iterator over a chain, most recent record first.
pub(crate) struct ChainIter<'a> {
    chain: &'a StatusChain,
    next: Option<u32>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (RecordId, &'a StatusRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let entry = self.chain.slots[index as usize].entry.as_ref()?;
        self.next = entry.parent;
        Some((self.chain.id_at(index), &entry.record))
    }
}

/// Walk a sibling list starting at `first`.
fn siblings(first: Option<&TaskRef>) -> impl Iterator<Item = &TaskRef> {
    // Safety: callers hold the parent's status lock (they borrow its chain)
    std::iter::successors(first, |task| unsafe { (*task.sibling_link()).as_ref() })
}

/// Link `child` under the child-carrying `record` of `parent`, keeping the
/// sibling list consistent under the parent's status lock. A child linked
/// under a cancelled parent is cancelled right away.
pub fn add_child_task(
    parent: &TaskRef,
    record: RecordId,
    child: &TaskRef,
) {
    parent.attach_child(record, child);
}

/// Unlink `child` from `record` of `parent`.
pub fn remove_child_task(
    parent: &TaskRef,
    record: RecordId,
    child: &TaskRef,
) {
    parent.detach_child(record, child);
}

/// Run `operation` with `handler` installed as a cancellation handler on
/// `task`. The record is removed when the operation finishes or is dropped.
pub async fn with_cancellation_handler<F, H>(
    task: &TaskRef,
    handler: H,
    operation: F,
) -> F::Output
where
    F: std::future::Future,
    H: Fn() + Send + Sync + 'static,
{
    let _guard = HandlerGuard {
        record: task.add_cancellation_handler(handler),
        task,
    };
    operation.await
}

struct HandlerGuard<'a> {
    task: &'a TaskRef,
    record: RecordId,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.task.remove_cancellation_handler(self.record);
    }
}
