//! Heap objects and manual reference counting
//!
//! Every runtime-managed allocation starts with a [`HeapHeader`]: a pointer
//! to static [`HeapMetadata`] describing how to destroy and free the object,
//! followed by its [`RefCounts`]. The free functions in this module are the
//! raw, type-erased entry points (`retain`, `release`, `try_retain`, the
//! unowned family and the non-atomic fast paths). [`HeapRef`], [`WeakRef`]
//! and [`UnownedRef`] wrap them in ownership-qualified handles.
//!
//! Lifecycle: an object is created with one strong reference. When the
//! strong count goes 1 -> 0 the object is marked deallocating, its value is
//! dropped, and the collective unowned reference is released. Memory is
//! returned to the global allocator once the unowned count reaches zero.

mod refcount;
mod refs;

pub use refcount::RefCounts;
pub use refs::{HeapRef, UnownedRef, WeakRef};

use std::alloc::{self, Layout};
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use refcount::Decrement;
use tracing::trace;

use crate::runtime::error::{fatal, FatalError};

/// Static description of a heap object's type.
#[derive(Debug)]
pub struct HeapMetadata {
    /// Type name, for diagnostics.
    pub type_name: fn() -> &'static str,
    /// Layout of the whole allocation, header included.
    pub layout: Layout,
    /// Drops the payload in place. Memory stays allocated.
    pub destroy: unsafe fn(NonNull<HeapHeader>),
}

impl HeapMetadata {
    #[inline]
    pub fn name(&self) -> &'static str {
        (self.type_name)()
    }
}

/// Header shared by all heap objects.
#[repr(C)]
#[derive(Debug)]
pub struct HeapHeader {
    metadata: &'static HeapMetadata,
    refcounts: RefCounts,
}

impl HeapHeader {
    #[inline]
    pub fn metadata(&self) -> &'static HeapMetadata {
        self.metadata
    }

    #[inline]
    pub fn refcounts(&self) -> &RefCounts {
        &self.refcounts
    }
}

/// A typed heap object: header followed by the payload.
#[repr(C)]
pub(crate) struct HeapObject<T> {
    header: HeapHeader,
    value: ManuallyDrop<T>,
}

impl<T> HeapObject<T> {
    const METADATA: HeapMetadata = HeapMetadata {
        type_name: std::any::type_name::<T>,
        layout: Layout::new::<HeapObject<T>>(),
        destroy: Self::destroy,
    };

    unsafe fn destroy(header: NonNull<HeapHeader>) {
        // Safety: `header` is the first field of a `HeapObject<T>` and the
        // strong count has reached zero, so nobody else reads the value.
        unsafe {
            let this = header.cast::<HeapObject<T>>().as_ptr();
            ptr::drop_in_place(ptr::addr_of_mut!((*this).value).cast::<T>());
        }
    }

    /// # Safety
    ///
    /// `header` must point at a live `HeapObject<T>` whose value has not been
    /// destroyed.
    #[inline]
    pub(crate) unsafe fn value<'a>(header: NonNull<HeapHeader>) -> &'a T {
        // Safety: ensured by caller; `ManuallyDrop` is transparent.
        unsafe {
            let this = header.cast::<HeapObject<T>>().as_ptr();
            &*ptr::addr_of!((*this).value).cast::<T>()
        }
    }
}

/// Allocate a heap object holding `value` with a strong count of one.
///
/// Allocation failure is fatal.
pub fn allocate<T>(value: T) -> NonNull<HeapHeader> {
    let layout = Layout::new::<HeapObject<T>>();
    // Safety: the layout always includes the header, so it is never zero-sized.
    let raw = unsafe { alloc::alloc(layout) }.cast::<HeapObject<T>>();
    let Some(ptr) = NonNull::new(raw) else {
        alloc::handle_alloc_error(layout);
    };
    // Safety: freshly allocated memory of the right layout.
    unsafe {
        ptr.as_ptr().write(HeapObject {
            header: HeapHeader {
                metadata: &HeapObject::<T>::METADATA,
                refcounts: RefCounts::new(),
            },
            value: ManuallyDrop::new(value),
        });
    }
    trace!(object = std::any::type_name::<T>(), addr = ?ptr, "allocated heap object");
    ptr.cast()
}

/// Increment the strong count.
///
/// # Safety
///
/// `obj` must point at a live heap object the caller holds a strong
/// reference to.
pub unsafe fn retain(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    if !header.refcounts.increment_strong() {
        fatal(FatalError::RetainDeallocating(header.metadata.name()));
    }
}

/// Decrement the strong count, destroying the object on the last release.
///
/// # Safety
///
/// `obj` must point at a heap object and the caller must own the strong
/// reference being released.
pub unsafe fn release(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    match header.refcounts.decrement_strong() {
        Decrement::Alive => {}
        // Safety: we performed the 1 -> 0 transition.
        Decrement::Last => unsafe { deinit(obj) },
        Decrement::Underflow => fatal(FatalError::OverRelease(header.metadata.name())),
    }
}

/// Try to take a new strong reference; fails once the object is deallocating.
///
/// # Safety
///
/// The memory behind `obj` must still be allocated (the caller holds at
/// least an unowned or weak reference).
pub unsafe fn try_retain(obj: NonNull<HeapHeader>) -> bool {
    // Safety: ensured by caller
    unsafe { obj.as_ref() }.refcounts.try_increment_strong()
}

/// # Safety
///
/// The caller must hold a strong, weak or unowned reference to `obj`.
pub unsafe fn unowned_retain(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    if !header.refcounts.increment_unowned() {
        fatal(FatalError::UnownedAfterDealloc(header.metadata.name()));
    }
}

/// # Safety
///
/// The caller must own the unowned reference being released.
pub unsafe fn unowned_release(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let (decrement, name) = {
        let header = unsafe { obj.as_ref() };
        (header.refcounts.decrement_unowned(), header.metadata.name())
    };
    match decrement {
        Decrement::Alive => {}
        // Safety: nobody references the memory anymore.
        Decrement::Last => unsafe { free(obj) },
        Decrement::Underflow => fatal(FatalError::UnownedUnderflow(name)),
    }
}

/// Load a strong reference through an unowned one, trapping if the object
/// is already deallocating.
///
/// # Safety
///
/// The caller must hold an unowned reference to `obj`.
pub unsafe fn unowned_retain_strong(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    if !header.refcounts.try_increment_strong() {
        fatal(FatalError::UnownedAfterDealloc(header.metadata.name()));
    }
}

/// Non-atomic retain.
///
/// # Safety
///
/// As [`retain`], and additionally the object must not be reachable from any
/// other thread.
pub unsafe fn retain_nonatomic(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    if !unsafe { header.refcounts.increment_strong_nonatomic() } {
        fatal(FatalError::RetainDeallocating(header.metadata.name()));
    }
}

/// Non-atomic release.
///
/// # Safety
///
/// As [`release`], and additionally the object must not be reachable from
/// any other thread.
pub unsafe fn release_nonatomic(obj: NonNull<HeapHeader>) {
    // Safety: ensured by caller
    let header = unsafe { obj.as_ref() };
    match unsafe { header.refcounts.decrement_strong_nonatomic() } {
        Decrement::Alive => {}
        Decrement::Last => unsafe { deinit(obj) },
        Decrement::Underflow => fatal(FatalError::OverRelease(header.metadata.name())),
    }
}

/// # Safety
///
/// `obj` must point at a live heap object.
#[inline]
pub unsafe fn strong_count(obj: NonNull<HeapHeader>) -> usize {
    unsafe { obj.as_ref() }.refcounts.strong_count()
}

/// # Safety
///
/// The memory behind `obj` must still be allocated.
#[inline]
pub unsafe fn is_deallocating(obj: NonNull<HeapHeader>) -> bool {
    unsafe { obj.as_ref() }.refcounts.is_deallocating()
}

unsafe fn deinit(obj: NonNull<HeapHeader>) {
    // Safety: the caller performed the 1 -> 0 strong transition.
    unsafe {
        let metadata = obj.as_ref().metadata;
        trace!(object = metadata.name(), addr = ?obj, "deinit heap object");
        (metadata.destroy)(obj);
        unowned_release(obj);
    }
}

unsafe fn free(obj: NonNull<HeapHeader>) {
    // Safety: unowned count reached zero, nothing else points here.
    unsafe {
        let layout = obj.as_ref().metadata.layout;
        trace!(addr = ?obj, size = layout.size(), "free heap object");
        alloc::dealloc(obj.as_ptr().cast(), layout);
    }
}

#[cfg(test)]
mod tests;
