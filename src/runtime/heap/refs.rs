//! Ownership-qualified handles over the raw reference-counting entry points.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use super::{HeapHeader, HeapObject};

/// Strong reference to a heap object.
pub struct HeapRef<T> {
    ptr: NonNull<HeapHeader>,
    _marker: PhantomData<HeapObject<T>>,
}

/// Weak reference: keeps the memory alive but never the value.
pub struct WeakRef<T> {
    ptr: NonNull<HeapHeader>,
    _marker: PhantomData<HeapObject<T>>,
}

/// Unowned reference: like [`WeakRef`], but loading through it after the
/// object started deallocating is a fatal error instead of `None`.
pub struct UnownedRef<T> {
    ptr: NonNull<HeapHeader>,
    _marker: PhantomData<HeapObject<T>>,
}

// === impl HeapRef ===

impl<T> HeapRef<T> {
    /// Allocate `value` on the runtime heap.
    pub fn new(value: T) -> Self {
        Self {
            ptr: super::allocate(value),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn header(this: &Self) -> &HeapHeader {
        // Safety: we hold a strong reference
        unsafe { this.ptr.as_ref() }
    }

    #[inline]
    pub fn as_ptr(this: &Self) -> NonNull<HeapHeader> {
        this.ptr
    }

    #[inline]
    pub fn strong_count(this: &Self) -> usize {
        Self::header(this).refcounts().strong_count()
    }

    #[inline]
    pub fn unowned_count(this: &Self) -> usize {
        Self::header(this).refcounts().unowned_count()
    }

    #[inline]
    pub fn ptr_eq(
        a: &Self,
        b: &Self,
    ) -> bool {
        a.ptr == b.ptr
    }

    pub fn downgrade(this: &Self) -> WeakRef<T> {
        // Safety: we hold a strong reference
        unsafe { super::unowned_retain(this.ptr) };
        WeakRef {
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }

    pub fn unowned(this: &Self) -> UnownedRef<T> {
        // Safety: we hold a strong reference
        unsafe { super::unowned_retain(this.ptr) };
        UnownedRef {
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }

    /// Give up the handle without releasing; pair with [`HeapRef::from_raw`].
    pub fn into_raw(this: Self) -> NonNull<HeapHeader> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from [`HeapRef::into_raw`] on a `HeapRef<T>` (the same
    /// `T`), and the strong reference it carried must not be used elsewhere.
    pub unsafe fn from_raw(ptr: NonNull<HeapHeader>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Take an additional strong reference from a raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live `HeapObject<T>` to which some strong
    /// reference is held for the duration of the call.
    pub unsafe fn clone_from_raw(ptr: NonNull<HeapHeader>) -> Self {
        unsafe { super::retain(ptr) };
        Self {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for HeapRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the strong reference keeps the value alive
        unsafe { HeapObject::<T>::value(self.ptr) }
    }
}

impl<T> Clone for HeapRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        // Safety: we hold a strong reference
        unsafe { super::retain(self.ptr) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for HeapRef<T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: we own this strong reference
        unsafe { super::release(self.ptr) }
    }
}

impl<T: fmt::Debug> fmt::Debug for HeapRef<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// Safety: same rules as `Arc<T>`
unsafe impl<T: Send + Sync> Send for HeapRef<T> {}
// Safety: same rules as `Arc<T>`
unsafe impl<T: Send + Sync> Sync for HeapRef<T> {}

// === impl WeakRef ===

impl<T> WeakRef<T> {
    /// Load a strong reference, or `None` once the object is deallocating.
    pub fn upgrade(&self) -> Option<HeapRef<T>> {
        // Safety: the weak reference keeps the memory allocated
        if unsafe { super::try_retain(self.ptr) } {
            Some(HeapRef {
                ptr: self.ptr,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        // Safety: the weak reference keeps the memory allocated
        !unsafe { super::is_deallocating(self.ptr) }
    }

    #[inline]
    pub fn ptr_eq(
        &self,
        other: &HeapRef<T>,
    ) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        // Safety: we hold a weak reference
        unsafe { super::unowned_retain(self.ptr) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WeakRef<T> {
    fn drop(&mut self) {
        // Safety: we own this reference
        unsafe { super::unowned_release(self.ptr) }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("addr", &self.ptr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// Safety: same rules as `std::sync::Weak<T>`
unsafe impl<T: Send + Sync> Send for WeakRef<T> {}
// Safety: same rules as `std::sync::Weak<T>`
unsafe impl<T: Send + Sync> Sync for WeakRef<T> {}

// === impl UnownedRef ===

impl<T> UnownedRef<T> {
    /// Load a strong reference. Traps if the object is deallocating.
    pub fn load(&self) -> HeapRef<T> {
        // Safety: the unowned reference keeps the memory allocated
        unsafe { super::unowned_retain_strong(self.ptr) };
        HeapRef {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        // Safety: the unowned reference keeps the memory allocated
        !unsafe { super::is_deallocating(self.ptr) }
    }
}

impl<T> Clone for UnownedRef<T> {
    fn clone(&self) -> Self {
        // Safety: we hold an unowned reference
        unsafe { super::unowned_retain(self.ptr) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for UnownedRef<T> {
    fn drop(&mut self) {
        // Safety: we own this reference
        unsafe { super::unowned_release(self.ptr) }
    }
}

impl<T> fmt::Debug for UnownedRef<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("UnownedRef")
            .field("addr", &self.ptr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// Safety: same rules as `std::sync::Weak<T>`
unsafe impl<T: Send + Sync> Send for UnownedRef<T> {}
// Safety: same rules as `std::sync::Weak<T>`
unsafe impl<T: Send + Sync> Sync for UnownedRef<T> {}
