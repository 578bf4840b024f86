//! Reference counting integration tests
//!
//! Strong, weak and unowned references shared between threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use weft::runtime::heap::HeapRef;
use weft::runtime::task::{self, TaskOptions};

struct Tracked {
    value: u64,
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_clones_across_threads_destroy_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let object = HeapRef::new(Tracked {
        value: 11,
        drops: drops.clone(),
    });
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let object = object.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut sum = 0;
                for _ in 0..1_000 {
                    let local = object.clone();
                    sum += local.value;
                }
                sum
            })
        })
        .collect();
    drop(object);

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 11_000);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_upgrade_races_final_release() {
    for _ in 0..64 {
        let drops = Arc::new(AtomicUsize::new(0));
        let object = HeapRef::new(Tracked {
            value: 3,
            drops: drops.clone(),
        });
        let weak = HeapRef::downgrade(&object);
        let barrier = Arc::new(Barrier::new(5));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let weak = weak.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen = 0;
                    while let Some(strong) = weak.upgrade() {
                        assert_eq!(strong.value, 3);
                        seen += 1;
                        if seen == 100 {
                            break;
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        drop(object);
        for reader in readers {
            reader.join().unwrap();
        }

        assert!(weak.upgrade().is_none());
        assert!(!weak.is_alive());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_unowned_reference_outlives_strong_use() {
    let object = HeapRef::new(String::from("shared"));
    let unowned = HeapRef::unowned(&object);
    assert_eq!(HeapRef::unowned_count(&object), 2);

    let loaded = unowned.load();
    assert_eq!(HeapRef::strong_count(&object), 2);
    drop(loaded);
    drop(object);
    assert!(!unowned.is_alive());
}

#[test]
fn test_finished_task_is_released_by_last_handle() {
    let task = task::create(TaskOptions::new(), |_| async { Ok(5u8) });
    let weak = task.task_ref().downgrade();
    let strong = task.task_ref().clone();
    let executor: Arc<dyn weft::runtime::scheduler::Executor> =
        weft::runtime::scheduler::ThreadPoolExecutor::new(1);
    strong.enqueue(&executor);

    assert_eq!(task.wait_blocking().unwrap(), 5);
    assert!(weak.is_alive());
    drop(strong);
    // The executor may still hold the job's reference for a moment.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while weak.is_alive() {
        assert!(std::time::Instant::now() < deadline);
        thread::yield_now();
    }
    assert!(weak.upgrade().is_none());
}
