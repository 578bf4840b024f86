//! Memory 单元测试
//!
//! 测试任务分配器（slab 链）的实现和行为

use std::alloc::Layout;

use crate::runtime::memory::{TaskAllocator, DEFAULT_SLAB_SIZE};

#[cfg(test)]
mod task_allocator_tests {
    use super::*;

    #[test]
    fn test_allocator_starts_without_slabs() {
        let allocator = TaskAllocator::new();
        assert_eq!(allocator.slabs().count(), 0);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn test_alloc_is_aligned_and_writable() {
        let allocator = TaskAllocator::new();
        let ptr = allocator.alloc(Layout::new::<u64>());
        assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
        unsafe {
            ptr.as_ptr().cast::<u64>().write(0xdead_beef);
            assert_eq!(ptr.as_ptr().cast::<u64>().read(), 0xdead_beef);
        }
        allocator.dealloc(ptr);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn test_over_aligned_allocation() {
        let allocator = TaskAllocator::new();
        let _pad = allocator.alloc(Layout::from_size_align(3, 1).unwrap());
        let ptr = allocator.alloc(Layout::from_size_align(32, 64).unwrap());
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
    }

    #[test]
    fn test_slab_chain_grows() {
        let allocator = TaskAllocator::with_slab_size(128);
        let layout = Layout::from_size_align(100, 8).unwrap();
        let a = allocator.alloc(layout);
        let b = allocator.alloc(layout);
        let slabs: Vec<_> = allocator.slabs().collect();
        assert_eq!(slabs.len(), 2);
        assert!(slabs.iter().all(|slab| slab.size >= 128));
        assert!(slabs.iter().all(|slab| slab.used >= 100));
        allocator.dealloc(b);
        allocator.dealloc(a);
        assert!(allocator.slabs().all(|slab| slab.used == 0));
    }

    #[test]
    fn test_large_allocation_gets_its_own_slab() {
        let allocator = TaskAllocator::new();
        let layout = Layout::from_size_align(DEFAULT_SLAB_SIZE * 4, 16).unwrap();
        let ptr = allocator.alloc(layout);
        let slab = allocator.slabs().next().unwrap();
        assert!(slab.size >= DEFAULT_SLAB_SIZE * 4);
        allocator.dealloc(ptr);
    }

    #[test]
    fn test_out_of_order_dealloc_is_deferred() {
        let allocator = TaskAllocator::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        let first = allocator.alloc(layout);
        let second = allocator.alloc(layout);

        allocator.dealloc(first);
        assert_eq!(allocator.live_allocations(), 2);

        allocator.dealloc(second);
        assert_eq!(allocator.live_allocations(), 0);
        assert_eq!(allocator.slabs().next().unwrap().used, 0);
    }

    #[test]
    fn test_memory_is_reused_after_dealloc() {
        let allocator = TaskAllocator::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let first = allocator.alloc(layout);
        allocator.dealloc(first);
        let again = allocator.alloc(layout);
        assert_eq!(first, again);
        allocator.dealloc(again);
    }
}
