//! Read-only task introspection
//!
//! Snapshots are taken without ever blocking the observed task: the status
//! word is read atomically, the status-record chain is only walked if its
//! lock can be taken on the first try, and the slab chain of the task's
//! allocator is followed through atomic links. Fields that could not be
//! read are `None`.

use serde::Serialize;

use crate::runtime::memory::SlabChunk;
use crate::runtime::task::{RecordKind, StatusFlags, TaskId, TaskPriority, TaskRef, TaskState};

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: Option<String>,
    pub state: TaskState,
    pub cancelled: bool,
    pub escalated: bool,
    pub base_priority: TaskPriority,
    pub current_priority: TaskPriority,
    pub parent: Option<TaskId>,
    pub group_child: bool,
    /// Record kinds, most recent first. `None` if the chain was locked.
    pub records: Option<Vec<RecordKind>>,
    /// Structured children. `None` if the chain was locked.
    pub children: Option<Vec<TaskId>>,
    pub slabs: Vec<SlabChunk>,
}

impl TaskSnapshot {
    #[inline]
    pub fn record_count(&self) -> Option<usize> {
        self.records.as_ref().map(Vec::len)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Snapshot one task.
pub fn snapshot(task: &TaskRef) -> TaskSnapshot {
    let status = task.status();
    let (records, children) = match task.try_lock_status() {
        Some(chain) => {
            let records = chain.iter().map(|(_, record)| record.kind()).collect();
            let children = chain.all_children().iter().map(TaskRef::id).collect();
            (Some(records), Some(children))
        }
        None => (None, None),
    };

    TaskSnapshot {
        id: task.id(),
        name: task.name().map(str::to_string),
        state: status.state(),
        cancelled: status.is_cancelled(),
        escalated: status.contains(StatusFlags::ESCALATED),
        base_priority: task.base_priority(),
        current_priority: status.priority(),
        parent: task.parent_id(),
        group_child: task.is_group_child(),
        records,
        children,
        slabs: allocator_slabs(task),
    }
}

/// Snapshot `root` and every structured descendant reachable without
/// blocking, depth first.
pub fn snapshot_tree(root: &TaskRef) -> Vec<TaskSnapshot> {
    let mut snapshots = Vec::new();
    let mut worklist = vec![root.clone()];
    while let Some(task) = worklist.pop() {
        if let Some(chain) = task.try_lock_status() {
            let children = chain.all_children();
            drop(chain);
            worklist.extend(children.into_iter().rev());
        }
        snapshots.push(snapshot(&task));
    }
    snapshots
}

/// The slabs of the task's allocator, oldest first.
pub fn allocator_slabs(task: &TaskRef) -> Vec<SlabChunk> {
    task.allocator().slabs().collect()
}
