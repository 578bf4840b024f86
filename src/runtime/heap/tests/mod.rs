//! Heap 单元测试
//!
//! 测试引用计数（strong / weak / unowned）的行为

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::runtime::heap::{self, HeapRef};

/// Counts how many times its destructor ran.
struct DropCounter {
    drops: Arc<AtomicUsize>,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn counted() -> (HeapRef<DropCounter>, Arc<AtomicUsize>) {
    let drops = Arc::new(AtomicUsize::new(0));
    let obj = HeapRef::new(DropCounter {
        drops: drops.clone(),
    });
    (obj, drops)
}

#[cfg(test)]
mod strong_tests {
    use super::*;

    #[test]
    fn test_new_object_has_one_strong_reference() {
        let obj = HeapRef::new(42u64);
        assert_eq!(HeapRef::strong_count(&obj), 1);
        assert_eq!(HeapRef::unowned_count(&obj), 1);
        assert_eq!(*obj, 42);
    }

    #[test]
    fn test_retain_release_round_trip() {
        let (obj, drops) = counted();
        let ptr = HeapRef::as_ptr(&obj);
        unsafe {
            heap::retain(ptr);
            assert_eq!(HeapRef::strong_count(&obj), 2);
            heap::release(ptr);
        }
        assert_eq!(HeapRef::strong_count(&obj), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_release_destroys_exactly_once() {
        let (obj, drops) = counted();
        let clone = obj.clone();
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nonatomic_variants() {
        let (obj, drops) = counted();
        let ptr = HeapRef::into_raw(obj);
        unsafe {
            heap::retain_nonatomic(ptr);
            assert_eq!(heap::strong_count(ptr), 2);
            heap::release_nonatomic(ptr);
            assert_eq!(heap::strong_count(ptr), 1);
            heap::release_nonatomic(ptr);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_retain_release() {
        let (obj, drops) = counted();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let obj = obj.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let extra = obj.clone();
                        drop(extra);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(HeapRef::strong_count(&obj), 1);
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod weak_tests {
    use super::*;

    #[test]
    fn test_weak_upgrade_while_alive() {
        let obj = HeapRef::new(String::from("live"));
        let weak = HeapRef::downgrade(&obj);
        assert_eq!(HeapRef::unowned_count(&obj), 2);
        let upgraded = weak.upgrade().expect("object is alive");
        assert!(HeapRef::ptr_eq(&obj, &upgraded));
        assert_eq!(HeapRef::strong_count(&obj), 2);
    }

    #[test]
    fn test_weak_upgrade_after_release_is_none() {
        let (obj, drops) = counted();
        let weak = HeapRef::downgrade(&obj);
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_try_retain_fails_when_deallocating() {
        let obj = HeapRef::new(7u8);
        let weak = HeapRef::downgrade(&obj);
        let ptr = HeapRef::as_ptr(&obj);
        drop(obj);
        unsafe {
            assert!(heap::is_deallocating(ptr));
            assert!(!heap::try_retain(ptr));
        }
        drop(weak);
    }

    #[test]
    fn test_weak_load_never_resurrects() {
        for _ in 0..200 {
            let (obj, drops) = counted();
            let weak = HeapRef::downgrade(&obj);
            let barrier = Arc::new(Barrier::new(2));

            let releaser = {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    drop(obj);
                })
            };

            barrier.wait();
            let mut upgrades = 0;
            while let Some(strong) = weak.upgrade() {
                upgrades += 1;
                drop(strong);
                if upgrades > 10_000 {
                    break;
                }
            }
            releaser.join().unwrap();

            assert!(weak.upgrade().is_none());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
    }
}

#[cfg(test)]
mod unowned_tests {
    use super::*;

    #[test]
    fn test_unowned_load_while_alive() {
        let obj = HeapRef::new(vec![1, 2, 3]);
        let unowned = HeapRef::unowned(&obj);
        let loaded = unowned.load();
        assert_eq!(loaded.len(), 3);
        assert_eq!(HeapRef::strong_count(&obj), 2);
    }

    #[test]
    fn test_unowned_keeps_memory_not_value() {
        let (obj, drops) = counted();
        let unowned = HeapRef::unowned(&obj);
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!unowned.is_alive());
    }
}
