//! Per-task slab allocator
//!
//! Every task owns a [`TaskAllocator`]: a chain of slabs carved with a bump
//! pointer and released in stack order. Scoped runtime structures (async-let
//! result buffers, scratch space requested through `TaskRef::alloc`) live
//! here so that they are reclaimed together with the task.
//!
//! The slab chain is append-only while the allocator lives and every link is
//! an atomic pointer, so debugging tools can walk it with [`TaskAllocator::slabs`]
//! without taking the allocator's lock. The `used` figures they observe are a
//! best-effort snapshot.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::runtime::error::{fatal, FatalError};

/// Default slab size in bytes.
pub const DEFAULT_SLAB_SIZE: usize = 1024;

/// Alignment of every slab's data block.
const SLAB_ALIGN: usize = 16;

/// A contiguous chunk owned by a task allocator.
struct Slab {
    next: AtomicPtr<Slab>,
    capacity: usize,
    used: AtomicUsize,
    data: NonNull<u8>,
}

impl Slab {
    fn allocate(capacity: usize) -> NonNull<Slab> {
        let layout = match Layout::from_size_align(capacity, SLAB_ALIGN) {
            Ok(layout) => layout,
            Err(_) => fatal(FatalError::Allocator(format!(
                "invalid slab capacity {}",
                capacity
            ))),
        };
        // Safety: capacity is never zero, see `TaskAllocator::new`
        let raw = unsafe { alloc::alloc(layout) };
        let Some(data) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        let slab = Box::new(Slab {
            next: AtomicPtr::new(ptr::null_mut()),
            capacity,
            used: AtomicUsize::new(0),
            data,
        });
        trace!(capacity, "allocated task slab");
        // Safety: Box::into_raw never returns null
        unsafe { NonNull::new_unchecked(Box::into_raw(slab)) }
    }

    /// # Safety
    ///
    /// `slab` must come from [`Slab::allocate`] and be unreachable afterwards.
    unsafe fn free(slab: NonNull<Slab>) {
        unsafe {
            let slab = Box::from_raw(slab.as_ptr());
            let layout = Layout::from_size_align_unchecked(slab.capacity, SLAB_ALIGN);
            alloc::dealloc(slab.data.as_ptr(), layout);
        }
    }
}

/// One live allocation, in allocation order.
struct Allocation {
    slab: NonNull<Slab>,
    /// The slab's `used` mark before this allocation.
    prev_used: usize,
    ptr: NonNull<u8>,
    freed: bool,
}

struct AllocState {
    current: Option<NonNull<Slab>>,
    stack: Vec<Allocation>,
}

/// Stack-discipline slab allocator owned by a task.
pub struct TaskAllocator {
    head: AtomicPtr<Slab>,
    state: Mutex<AllocState>,
    slab_size: usize,
}

// Safety: slab pointers are only dereferenced under `state`'s lock, except for
// the atomic fields read by `slabs()`, and slabs are freed only on drop.
unsafe impl Send for TaskAllocator {}
// Safety: see above
unsafe impl Sync for TaskAllocator {}

/// Snapshot of one slab, as seen by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlabChunk {
    /// Address of the slab's data block.
    pub addr: usize,
    /// Capacity in bytes.
    pub size: usize,
    /// Bytes handed out at snapshot time.
    pub used: usize,
}

/// Lock-free iterator over a task allocator's slab chain.
pub struct SlabIter<'a> {
    next: *const Slab,
    _allocator: &'a TaskAllocator,
}

impl TaskAllocator {
    /// Create an allocator with the default slab size.
    pub fn new() -> Self {
        Self::with_slab_size(DEFAULT_SLAB_SIZE)
    }

    /// Create an allocator whose slabs hold at least `slab_size` bytes.
    pub fn with_slab_size(slab_size: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            state: Mutex::new(AllocState {
                current: None,
                stack: Vec::new(),
            }),
            slab_size: slab_size.max(SLAB_ALIGN),
        }
    }

    /// Allocate memory for `layout`. Never fails; exhaustion is fatal.
    pub fn alloc(
        &self,
        layout: Layout,
    ) -> NonNull<u8> {
        let mut state = self.state.lock();
        let mut slab = match state.current {
            Some(slab) => slab,
            None => self.first_slab(layout),
        };

        loop {
            // Safety: slabs stay allocated until the allocator is dropped
            let slab_ref = unsafe { slab.as_ref() };
            let used = slab_ref.used.load(Ordering::Relaxed);
            let base = slab_ref.data.as_ptr() as usize;
            let start = align_up(base + used, layout.align());
            let end = start + layout.size();

            if end <= base + slab_ref.capacity {
                slab_ref.used.store(end - base, Ordering::Release);
                // Safety: `start` lies within the slab's data block
                let ptr = unsafe { NonNull::new_unchecked(start as *mut u8) };
                state.current = Some(slab);
                state.stack.push(Allocation {
                    slab,
                    prev_used: used,
                    ptr,
                    freed: false,
                });
                return ptr;
            }

            // Slabs past the current one hold no live allocations, reuse them.
            let next = slab_ref.next.load(Ordering::Acquire);
            slab = match NonNull::new(next) {
                Some(next) => {
                    // Safety: as above
                    unsafe { next.as_ref() }.used.store(0, Ordering::Release);
                    next
                }
                None => {
                    let fresh = Slab::allocate(self.capacity_for(layout));
                    slab_ref.next.store(fresh.as_ptr(), Ordering::Release);
                    fresh
                }
            };
        }
    }

    /// Release an allocation. Memory is reclaimed in stack order: freeing
    /// anything but the most recent allocation only marks it, and it is
    /// reclaimed once everything allocated after it is gone.
    pub fn dealloc(
        &self,
        ptr: NonNull<u8>,
    ) {
        let mut state = self.state.lock();
        let Some(index) = state
            .stack
            .iter()
            .rposition(|allocation| allocation.ptr == ptr && !allocation.freed)
        else {
            fatal(FatalError::Allocator(format!(
                "dealloc of unknown pointer {:p}",
                ptr
            )));
        };
        state.stack[index].freed = true;

        while state.stack.last().is_some_and(|top| top.freed) {
            if let Some(top) = state.stack.pop() {
                // Safety: slabs stay allocated until the allocator is dropped
                unsafe { top.slab.as_ref() }
                    .used
                    .store(top.prev_used, Ordering::Release);
                state.current = Some(top.slab);
            }
        }
    }

    /// Number of allocations not yet reclaimed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().stack.len()
    }

    /// Walk the slab chain without taking the allocator's lock.
    pub fn slabs(&self) -> SlabIter<'_> {
        SlabIter {
            next: self.head.load(Ordering::Acquire),
            _allocator: self,
        }
    }

    fn first_slab(
        &self,
        layout: Layout,
    ) -> NonNull<Slab> {
        let existing = self.head.load(Ordering::Acquire);
        if let Some(head) = NonNull::new(existing) {
            return head;
        }
        let slab = Slab::allocate(self.capacity_for(layout));
        self.head.store(slab.as_ptr(), Ordering::Release);
        slab
    }

    fn capacity_for(
        &self,
        layout: Layout,
    ) -> usize {
        self.slab_size.max(layout.size() + layout.align())
    }
}

impl Default for TaskAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskAllocator {
    fn drop(&mut self) {
        let live = self.state.get_mut().stack.len();
        if live > 0 {
            trace!(live, "task allocator dropped with live allocations");
        }
        let mut next = *self.head.get_mut();
        while let Some(slab) = NonNull::new(next) {
            // Safety: we have exclusive access; each slab is freed once
            unsafe {
                next = slab.as_ref().next.load(Ordering::Relaxed);
                Slab::free(slab);
            }
        }
    }
}

impl fmt::Debug for TaskAllocator {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskAllocator")
            .field("slab_size", &self.slab_size)
            .field("slabs", &self.slabs().count())
            .finish()
    }
}

impl<'a> Iterator for SlabIter<'a> {
    type Item = SlabChunk;

    fn next(&mut self) -> Option<SlabChunk> {
        // Safety: the borrowed allocator keeps every slab in the chain alive
        let slab = unsafe { self.next.as_ref()? };
        self.next = slab.next.load(Ordering::Acquire);
        Some(SlabChunk {
            addr: slab.data.as_ptr() as usize,
            size: slab.capacity,
            used: slab.used.load(Ordering::Acquire),
        })
    }
}

#[inline]
fn align_up(
    addr: usize,
    align: usize,
) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests;
