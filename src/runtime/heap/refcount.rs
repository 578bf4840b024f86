//! The two reference-count words carried by every heap object.
//!
//! The strong word packs the strong count together with the
//! `DEALLOCATING` flag so that "count reached zero" and "no more strong
//! references may be created" become visible in the same atomic step.
//! The unowned word counts unowned and weak references plus one extra
//! reference held collectively by all strong references; memory is freed
//! when it reaches zero.

use std::fmt;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Set once the strong count has dropped to zero.
const DEALLOCATING: usize = 1 << (usize::BITS - 1);
const STRONG_MASK: usize = !DEALLOCATING;
/// Saturation guard, well below the flag bit.
const MAX_STRONG: usize = STRONG_MASK >> 1;

/// Outcome of a strong or unowned decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decrement {
    /// Other references remain.
    Alive,
    /// This was the last reference.
    Last,
    /// The count was already zero.
    Underflow,
}

pub struct RefCounts {
    strong: AtomicUsize,
    unowned: AtomicUsize,
}

impl RefCounts {
    /// A fresh object: one strong reference and the collective unowned one.
    pub const fn new() -> Self {
        Self {
            strong: AtomicUsize::new(1),
            unowned: AtomicUsize::new(1),
        }
    }

    /// Current strong count, zero once deallocating.
    #[inline]
    pub fn strong_count(&self) -> usize {
        let bits = self.strong.load(Ordering::Acquire);
        if bits & DEALLOCATING != 0 {
            0
        } else {
            bits & STRONG_MASK
        }
    }

    #[inline]
    pub fn unowned_count(&self) -> usize {
        self.unowned.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_deallocating(&self) -> bool {
        self.strong.load(Ordering::Acquire) & DEALLOCATING != 0
    }

    /// Returns `false` if the object was already deallocating.
    #[inline]
    pub(crate) fn increment_strong(&self) -> bool {
        let old = self.strong.fetch_add(1, Ordering::Relaxed);
        if old & STRONG_MASK >= MAX_STRONG {
            std::process::abort();
        }
        old & DEALLOCATING == 0 && old & STRONG_MASK != 0
    }

    /// Increment only if the object is not deallocating.
    pub(crate) fn try_increment_strong(&self) -> bool {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current & DEALLOCATING != 0 || current & STRONG_MASK == 0 {
                return false;
            }
            match self.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// The 1 -> 0 transition stores `DEALLOCATING` in a single CAS so that a
    /// racing `try_increment_strong` can never observe a zero count without
    /// the flag.
    pub(crate) fn decrement_strong(&self) -> Decrement {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current & DEALLOCATING != 0 || current == 0 {
                return Decrement::Underflow;
            }
            let next = if current == 1 { DEALLOCATING } else { current - 1 };
            match self.strong.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) if next == DEALLOCATING => {
                    fence(Ordering::Acquire);
                    return Decrement::Last;
                }
                Ok(_) => return Decrement::Alive,
                Err(actual) => current = actual,
            }
        }
    }

    /// # Safety
    ///
    /// No other thread may access the counts concurrently.
    pub(crate) unsafe fn increment_strong_nonatomic(&self) -> bool {
        let old = self.strong.load(Ordering::Relaxed);
        if old & DEALLOCATING != 0 || old == 0 {
            return false;
        }
        self.strong.store(old + 1, Ordering::Relaxed);
        true
    }

    /// # Safety
    ///
    /// No other thread may access the counts concurrently.
    pub(crate) unsafe fn decrement_strong_nonatomic(&self) -> Decrement {
        let old = self.strong.load(Ordering::Relaxed);
        match old {
            _ if old & DEALLOCATING != 0 || old == 0 => Decrement::Underflow,
            1 => {
                self.strong.store(DEALLOCATING, Ordering::Relaxed);
                Decrement::Last
            }
            _ => {
                self.strong.store(old - 1, Ordering::Relaxed);
                Decrement::Alive
            }
        }
    }

    /// Returns `false` if the memory had already been released.
    #[inline]
    pub(crate) fn increment_unowned(&self) -> bool {
        self.unowned.fetch_add(1, Ordering::Relaxed) != 0
    }

    pub(crate) fn decrement_unowned(&self) -> Decrement {
        match self.unowned.fetch_sub(1, Ordering::Release) {
            0 => Decrement::Underflow,
            1 => {
                fence(Ordering::Acquire);
                Decrement::Last
            }
            _ => Decrement::Alive,
        }
    }
}

impl Default for RefCounts {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCounts {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RefCounts")
            .field("strong", &self.strong_count())
            .field("unowned", &self.unowned_count())
            .field("deallocating", &self.is_deallocating())
            .finish()
    }
}
