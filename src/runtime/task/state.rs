//! Task status word.
//!
//! All scheduling state of a task lives in one `AtomicU64`: the flag bits
//! below plus the current priority in bits 16..24. Every update goes through
//! [`StatusCell::transition`], a CAS loop over a closure, so a transition
//! either applies completely or not at all.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flag bits of the task status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u64 {
        /// Cancellation was requested. Never cleared.
        const CANCELLED = 1 << 0;
        /// The status-record chain is locked.
        const LOCKED = 1 << 1;
        /// A job for this task sits in an executor queue.
        const ENQUEUED = 1 << 2;
        /// The body is being polled.
        const RUNNING = 1 << 3;
        /// The body returned; the outcome is stored or was handed off.
        const COMPLETED = 1 << 4;
        /// Woken while running; re-enqueue after the current poll.
        const NOTIFIED = 1 << 5;
        /// The priority was raised above the base priority.
        const ESCALATED = 1 << 6;
        /// At least one status record is installed.
        const HAS_RECORDS = 1 << 7;
    }
}

const PRIORITY_SHIFT: u32 = 16;
const PRIORITY_MASK: u64 = 0xff << PRIORITY_SHIFT;

/// Task priority. Higher values run first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskPriority(pub u8);

impl TaskPriority {
    pub const UNSPECIFIED: TaskPriority = TaskPriority(0);
    pub const BACKGROUND: TaskPriority = TaskPriority(9);
    pub const UTILITY: TaskPriority = TaskPriority(17);
    pub const MEDIUM: TaskPriority = TaskPriority(21);
    pub const HIGH: TaskPriority = TaskPriority(25);
    pub const USER_INTERACTIVE: TaskPriority = TaskPriority(33);

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Priority a new task starts with when nothing was requested.
    #[inline]
    pub fn or_default(self) -> TaskPriority {
        if self == TaskPriority::UNSPECIFIED {
            TaskPriority::MEDIUM
        } else {
            self
        }
    }
}

impl From<u8> for TaskPriority {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match *self {
            TaskPriority::BACKGROUND => f.write_str("background"),
            TaskPriority::UTILITY => f.write_str("utility"),
            TaskPriority::MEDIUM => f.write_str("medium"),
            TaskPriority::HIGH => f.write_str("high"),
            TaskPriority::USER_INTERACTIVE => f.write_str("user-interactive"),
            TaskPriority(other) => write!(f, "priority({})", other),
        }
    }
}

/// Coarse lifecycle state, derived from the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created or parked, no job queued.
    Suspended,
    /// A job is queued on some executor.
    Enqueued,
    /// Being polled right now.
    Running,
    /// The body finished.
    Completed,
}

/// A decoded copy of the status word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Status(u64);

impl Status {
    pub(crate) fn new(priority: TaskPriority) -> Self {
        let mut status = Status(0);
        status.set_priority(priority);
        status
    }

    #[inline]
    pub fn flags(self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn contains(
        self,
        flags: StatusFlags,
    ) -> bool {
        self.flags().contains(flags)
    }

    #[inline]
    pub(crate) fn set(
        &mut self,
        flags: StatusFlags,
        value: bool,
    ) {
        if value {
            self.0 |= flags.bits();
        } else {
            self.0 &= !flags.bits();
        }
    }

    #[inline]
    pub fn priority(self) -> TaskPriority {
        TaskPriority(((self.0 & PRIORITY_MASK) >> PRIORITY_SHIFT) as u8)
    }

    #[inline]
    pub(crate) fn set_priority(
        &mut self,
        priority: TaskPriority,
    ) {
        self.0 = (self.0 & !PRIORITY_MASK) | ((priority.0 as u64) << PRIORITY_SHIFT);
    }

    #[inline]
    pub fn is_cancelled(self) -> bool {
        self.contains(StatusFlags::CANCELLED)
    }

    #[inline]
    pub fn is_locked(self) -> bool {
        self.contains(StatusFlags::LOCKED)
    }

    #[inline]
    pub fn is_completed(self) -> bool {
        self.contains(StatusFlags::COMPLETED)
    }

    pub fn state(self) -> TaskState {
        let flags = self.flags();
        if flags.contains(StatusFlags::COMPLETED) {
            TaskState::Completed
        } else if flags.contains(StatusFlags::RUNNING) {
            TaskState::Running
        } else if flags.contains(StatusFlags::ENQUEUED) {
            TaskState::Enqueued
        } else {
            TaskState::Suspended
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Status")
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .finish()
    }
}

/// The atomic status word of a task.
pub(crate) struct StatusCell(AtomicU64);

impl StatusCell {
    pub(crate) fn new(initial: Status) -> Self {
        Self(AtomicU64::new(initial.0))
    }

    #[inline]
    pub(crate) fn load(&self) -> Status {
        Status(self.0.load(Ordering::Acquire))
    }

    /// Apply `transition` atomically. The closure may run several times if
    /// the word changes underneath it, so it must not have side effects.
    pub(crate) fn transition<T>(
        &self,
        mut transition: impl FnMut(&mut Status) -> T,
    ) -> T {
        let mut current = self.load();
        loop {
            let mut next = current;
            let result = transition(&mut next);
            if next == current {
                return result;
            }
            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return result,
                Err(actual) => current = Status(actual),
            }
        }
    }

    /// Acquire the status lock, spinning while someone else holds it.
    pub(crate) fn lock(&self) -> Status {
        let backoff = Backoff::new();
        loop {
            let current = self.load();
            if current.is_locked() {
                backoff.snooze();
                continue;
            }
            let mut next = current;
            next.set(StatusFlags::LOCKED, true);
            if self
                .0
                .compare_exchange_weak(current.0, next.0, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Acquire the status lock, applying `update` in the same CAS. Returns
    /// `None` without locking when `update` declines.
    pub(crate) fn lock_if(
        &self,
        mut update: impl FnMut(&mut Status) -> bool,
    ) -> Option<Status> {
        let backoff = Backoff::new();
        let mut current = self.load();
        loop {
            if current.is_locked() {
                backoff.snooze();
                current = self.load();
                continue;
            }
            let mut next = current;
            if !update(&mut next) {
                return None;
            }
            next.set(StatusFlags::LOCKED, true);
            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = Status(actual),
            }
        }
    }

    /// Acquire the status lock only if it is free right now.
    pub(crate) fn try_lock(&self) -> bool {
        let current = self.load();
        if current.is_locked() {
            return false;
        }
        let mut next = current;
        next.set(StatusFlags::LOCKED, true);
        self.0
            .compare_exchange(current.0, next.0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(
        &self,
        has_records: bool,
    ) {
        let clear = if has_records {
            StatusFlags::LOCKED.bits()
        } else {
            (StatusFlags::LOCKED | StatusFlags::HAS_RECORDS).bits()
        };
        let set = if has_records {
            StatusFlags::HAS_RECORDS.bits()
        } else {
            0
        };
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (current & !clear) | set;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
