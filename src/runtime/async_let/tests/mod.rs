//! AsyncLet 单元测试
//!
//! 测试结果收集、作用域结束时的取消、缓冲区分配位置和优先级提升

use crate::runtime::async_let::{AsyncLet, MAX_SLAB_RESULT};
use crate::runtime::continuation::yield_now;
use crate::runtime::error::{TaskError, TaskResult};
use crate::runtime::scheduler::CooperativeExecutor;
use crate::runtime::task::{self, CurrentTask, RecordKind, TaskOptions, TaskPriority};

fn block_on<T, F, Fut>(body: F) -> TaskResult<T>
where
    T: Send + 'static,
    F: FnOnce(CurrentTask) -> Fut,
    Fut: std::future::Future<Output = TaskResult<T>> + Send + 'static,
{
    let executor = CooperativeExecutor::new();
    executor.block_on(task::create(TaskOptions::new(), body))
}

async fn until_cancelled(current: CurrentTask) -> TaskResult<u64> {
    while !current.is_cancelled() {
        yield_now().await;
    }
    Err(TaskError::Cancelled)
}

#[cfg(test)]
mod collect_tests {
    use super::*;

    #[test]
    fn test_get_is_repeatable() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let value = block_on(move |current| async move {
            let mut answer = AsyncLet::begin(&current, TaskOptions::new(), move |_| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                yield_now().await;
                Ok(41u64)
            });
            for _ in 0..3 {
                assert_eq!(*answer.get().await?, 41);
                assert!(answer.task_ref().is_completed());
            }
            answer.consume().await
        })
        .unwrap();
        assert_eq!(value, 41);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consume_takes_value() {
        let value = block_on(|current| async move {
            let left = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(20u64) });
            let right = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(22u64) });
            Ok(left.consume().await? + right.consume().await?)
        })
        .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_error_is_observed_by_every_get() {
        block_on(|current| async move {
            let mut failing = AsyncLet::<u64>::begin(&current, TaskOptions::new(), |_| async {
                Err(TaskError::msg("lookup failed"))
            });
            let first = failing.get().await.map(|value| *value).unwrap_err();
            let second = failing.get().await.map(|value| *value).unwrap_err();
            let third = failing.get().await.map(|value| *value).unwrap_err();
            assert!(first.same_as(&second));
            assert!(second.same_as(&third));
            assert!(first.to_string().contains("lookup failed"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_child_is_linked_under_parent() {
        block_on(|current| async move {
            let child = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(1u64) });
            assert_eq!(child.task_ref().parent_id(), Some(current.id()));
            assert!(!child.task_ref().is_group_child());
            assert_eq!(current.task().record_kinds(), vec![RecordKind::ChildTask]);

            assert_eq!(child.consume().await?, 1);
            assert!(current.task().record_kinds().is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_get_escalates_child() {
        let (base, observed) = block_on(|current| async move {
            let options = TaskOptions::new()
                .priority(TaskPriority::BACKGROUND)
                .inherit_priority(false);
            let child = AsyncLet::begin(&current, options, |child| async move {
                Ok(child.priority())
            });
            let base = child.task_ref().base_priority();
            Ok((base, child.consume().await?))
        })
        .unwrap();
        assert_eq!(base, TaskPriority::BACKGROUND);
        assert_eq!(observed, TaskPriority::MEDIUM);
    }
}

#[cfg(test)]
mod scope_tests {
    use super::*;

    #[test]
    fn test_finish_cancels_unawaited_child() {
        block_on(|current| async move {
            let pending = AsyncLet::begin(&current, TaskOptions::new(), until_cancelled);
            let child = pending.task_ref().clone();
            pending.finish().await;
            assert!(child.is_completed());
            assert!(child.is_cancelled());
            assert!(!current.is_cancelled());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_finish_after_get_leaves_child_alone() {
        block_on(|current| async move {
            let mut done = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(5u64) });
            assert_eq!(*done.get().await?, 5);
            let child = done.task_ref().clone();
            done.finish().await;
            assert!(!child.is_cancelled());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_drop_cancels_and_unlinks() {
        block_on(|current| async move {
            let pending = AsyncLet::begin(&current, TaskOptions::new(), until_cancelled);
            let child = pending.task_ref().clone();
            assert_eq!(current.task().record_kinds(), vec![RecordKind::ChildTask]);

            drop(pending);
            assert!(child.is_cancelled());
            assert!(current.task().record_kinds().is_empty());
            child.wait().await;
            assert!(child.is_completed());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_parent_cancel_reaches_child() {
        block_on(|current| async move {
            let pending = AsyncLet::begin(&current, TaskOptions::new(), until_cancelled);
            current.task().cancel();
            assert!(pending.task_ref().is_cancelled());
            assert!(matches!(pending.consume().await, Err(TaskError::Cancelled)));
            Ok(())
        })
        .unwrap();
    }
}

#[cfg(test)]
mod buffer_tests {
    use super::*;

    #[test]
    fn test_small_outcome_lives_in_slab() {
        block_on(|current| async move {
            let small = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(3u64) });
            assert!(small.is_slab_allocated());
            assert!(current.task().allocator().live_allocations() >= 1);
            assert_eq!(small.consume().await?, 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_large_outcome_lives_on_heap() {
        block_on(|current| async move {
            let large = AsyncLet::begin(&current, TaskOptions::new(), |_| async {
                Ok([7u8; MAX_SLAB_RESULT * 2])
            });
            assert!(!large.is_slab_allocated());
            let bytes = large.consume().await?;
            assert!(bytes.iter().all(|byte| *byte == 7));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_slab_value_is_dropped_with_handle() {
        use std::sync::Arc;

        let shared = Arc::new(());
        let observed = shared.clone();
        block_on(move |current| async move {
            let mut holder = AsyncLet::begin(&current, TaskOptions::new(), move |_| async move {
                Ok(observed)
            });
            assert!(holder.is_slab_allocated());
            let _ = holder.get().await?;
            drop(holder);
            Ok(())
        })
        .unwrap();
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
