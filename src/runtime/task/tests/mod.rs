//! Task 单元测试
//!
//! 测试任务状态机、取消、优先级提升和状态记录链

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use crate::runtime::error::TaskError;
use crate::runtime::scheduler::{CooperativeExecutor, Executor};
use crate::runtime::task::{
    self, add_child_task, create_child_task, remove_child_task, with_cancellation_handler,
    RecordKind, RemoveError, StatusChain, StatusRecord, TaskOptions, TaskPriority, TaskRef,
    TaskState,
};

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = {
        let hits = hits.clone();
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    };
    (hits, handler)
}

fn idle_task() -> TaskRef {
    task::create(TaskOptions::new(), |_| async { Ok(()) }).into_ref()
}

fn as_dyn(executor: &Arc<CooperativeExecutor>) -> Arc<dyn Executor> {
    executor.clone()
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_created_task_is_suspended() {
        let task = task::create(TaskOptions::new().name("worker"), |_| async { Ok(1) });
        let task = task.task_ref();
        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(task.name(), Some("worker"));
        assert_eq!(task.current_priority(), TaskPriority::MEDIUM);
        assert!(!task.is_cancelled());
        assert_eq!(format!("{}", task.id()), format!("Task({})", task.id().as_u64()));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = idle_task();
        let b = idle_task();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_run_to_completion() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |_| async { Ok("done".to_string()) });
        let task_ref = task.task_ref().clone();
        assert_eq!(executor.block_on(task).unwrap(), "done");
        assert_eq!(task_ref.state(), TaskState::Completed);
    }

    #[test]
    fn test_body_error_is_outcome() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |_| async {
            Err::<(), _>(TaskError::msg("boom"))
        });
        let err = executor.block_on(task).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_panic_becomes_panicked() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |_| async {
            if true {
                panic!("exploded");
            }
            Ok(())
        });
        match executor.block_on(task) {
            Err(TaskError::Panicked(message)) => assert!(message.contains("exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_outcome_is_taken_once() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |_| async { Ok(5u8) });
        let task_ref = task.task_ref().clone();
        assert_eq!(executor.block_on(task).unwrap(), 5);
        assert!(matches!(task_ref.take_typed::<u8>(), Err(TaskError::Consumed)));
    }

    #[test]
    fn test_enqueue_twice_queues_once() {
        let executor = CooperativeExecutor::new();
        let dyn_executor = as_dyn(&executor);
        let task = idle_task();
        task.enqueue(&dyn_executor);
        task.enqueue(&dyn_executor);
        assert_eq!(task.state(), TaskState::Enqueued);
        assert_eq!(executor.pending(), 1);
        assert_eq!(executor.run_until_idle(), 1);
        assert!(task.is_completed());
    }

    #[test]
    fn test_run_inline() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |_| async { Ok(9u32) });
        task.task_ref().run(&as_dyn(&executor));
        assert!(task.task_ref().is_completed());
        assert_eq!(task.wait_blocking().unwrap(), 9);
    }

    #[test]
    fn test_wait_on_other_task() {
        let executor = CooperativeExecutor::new();
        let dyn_executor = as_dyn(&executor);
        let inner = task::create(TaskOptions::new(), |_| async {
            crate::runtime::continuation::yield_now().await;
            Ok(20u32)
        });
        let inner_ref = inner.task_ref().clone();
        inner_ref.enqueue(&dyn_executor);

        let outer = task::create(TaskOptions::new(), move |_| async move {
            let value = inner.value().await?;
            Ok(value + 1)
        });
        assert_eq!(executor.block_on(outer).unwrap(), 21);
    }

    #[test]
    fn test_switch_to_moves_execution() {
        let first = CooperativeExecutor::new();
        let second = CooperativeExecutor::new();
        let target = as_dyn(&second);
        let task = task::create(TaskOptions::new(), move |current| async move {
            current.switch_to(target).await;
            Ok(current.task().current_executor().map(|e| e.name().to_string()))
        });
        let task_ref = task.task_ref().clone();
        task_ref.enqueue(&as_dyn(&first));

        first.run_until_idle();
        assert!(!task_ref.is_completed());
        assert_eq!(second.pending(), 1);
        second.run_until_idle();
        assert!(task_ref.is_completed());
        assert_eq!(task.wait_blocking().unwrap().as_deref(), Some("cooperative"));
    }
}

#[cfg(test)]
mod cancel_tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let task = idle_task();
        let (hits, handler) = counter();
        let record = task.add_cancellation_handler(handler);

        task.cancel();
        task.cancel();
        task::cancel(&task);

        assert!(task.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        task.remove_cancellation_handler(record);
    }

    #[test]
    fn test_handler_on_cancelled_task_fires_immediately() {
        let task = idle_task();
        task.cancel();
        let (hits, handler) = counter();
        let record = task.add_cancellation_handler(handler);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        task.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        task.remove_cancellation_handler(record);
    }

    #[test]
    fn test_cancel_reaches_children() {
        let parent = idle_task();
        let (child, record) = create_child_task(&parent, TaskOptions::new(), |_| async { Ok(()) });
        let (grandchild, inner) =
            create_child_task(child.task_ref(), TaskOptions::new(), |_| async { Ok(()) });

        parent.cancel();
        assert!(child.task_ref().is_cancelled());
        assert!(grandchild.task_ref().is_cancelled());

        child.task_ref().remove_child_record(inner);
        parent.remove_child_record(record);
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = idle_task();
        parent.cancel();
        let (child, record) = create_child_task(&parent, TaskOptions::new(), |_| async { Ok(()) });
        assert!(child.task_ref().is_cancelled());
        parent.remove_child_record(record);
    }

    #[test]
    fn test_attach_to_cancelled_parent_cancels_child() {
        let parent = idle_task();
        let record = parent.add_status_record(StatusRecord::ChildTask { first_child: None });
        parent.cancel();

        let child = idle_task();
        add_child_task(&parent, record, &child);
        assert!(child.is_cancelled());

        remove_child_task(&parent, record, &child);
        parent.remove_child_record(record);
    }

    #[test]
    fn test_cancelling_child_leaves_parent_alone() {
        let parent = idle_task();
        let (child, record) = create_child_task(&parent, TaskOptions::new(), |_| async { Ok(()) });
        child.cancel();
        assert!(!parent.is_cancelled());
        parent.remove_child_record(record);
    }

    #[test]
    fn test_body_observes_cancellation() {
        let executor = CooperativeExecutor::new();
        let task = task::create(TaskOptions::new(), |current| async move {
            current.check_cancellation()?;
            Ok(())
        });
        task.cancel();
        assert!(executor.block_on(task).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_with_cancellation_handler_scoped() {
        let executor = CooperativeExecutor::new();
        let (hits, handler) = counter();
        let task = task::create(TaskOptions::new(), move |current| async move {
            let me = current.task();
            with_cancellation_handler(&me, handler, async {
                me.cancel();
            })
            .await;
            Ok(me.record_kinds())
        });
        let kinds = executor.block_on(task).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(kinds.is_empty());
    }
}

#[cfg(test)]
mod escalation_tests {
    use super::*;

    #[test]
    fn test_escalate_raises_and_notifies() {
        let task = idle_task();
        let seen = Arc::new(AtomicUsize::new(0));
        let record = task.add_escalation_handler({
            let seen = seen.clone();
            move |priority: TaskPriority| {
                seen.store(priority.get() as usize, Ordering::SeqCst);
            }
        });

        let effective = task.escalate(TaskPriority::HIGH);
        assert_eq!(effective, TaskPriority::HIGH);
        assert_eq!(task.current_priority(), TaskPriority::HIGH);
        assert_eq!(task.base_priority(), TaskPriority::MEDIUM);
        assert_eq!(seen.load(Ordering::SeqCst), TaskPriority::HIGH.get() as usize);
        task.remove_escalation_handler(record);
    }

    #[test]
    fn test_escalate_lower_is_noop() {
        let task = idle_task();
        task.escalate(TaskPriority::HIGH);
        let effective = task.escalate(TaskPriority::UTILITY);
        assert_eq!(effective, TaskPriority::HIGH);
        assert_eq!(task.current_priority(), TaskPriority::HIGH);
    }

    #[test]
    fn test_escalate_reaches_children() {
        let parent = idle_task();
        let (child, record) = create_child_task(&parent, TaskOptions::new(), |_| async { Ok(()) });
        parent.escalate(TaskPriority::USER_INTERACTIVE);
        assert_eq!(child.task_ref().current_priority(), TaskPriority::USER_INTERACTIVE);
        parent.remove_child_record(record);
    }

    #[test]
    fn test_child_inherits_priority() {
        let parent =
            task::create(TaskOptions::new().priority(TaskPriority::HIGH), |_| async { Ok(()) })
                .into_ref();
        let (child, record) = create_child_task(
            &parent,
            TaskOptions::new().priority(TaskPriority::BACKGROUND),
            |_| async { Ok(()) },
        );
        assert_eq!(child.task_ref().base_priority(), TaskPriority::HIGH);
        parent.remove_child_record(record);

        let (detached, record) = create_child_task(
            &parent,
            TaskOptions::new()
                .priority(TaskPriority::BACKGROUND)
                .inherit_priority(false),
            |_| async { Ok(()) },
        );
        assert_eq!(detached.task_ref().base_priority(), TaskPriority::BACKGROUND);
        parent.remove_child_record(record);
    }

    proptest! {
        #[test]
        fn prop_escalation_is_monotonic(steps in proptest::collection::vec(0u8..=40, 1..16)) {
            let task = idle_task();
            let mut highest = task.current_priority();
            for step in steps {
                let effective = task.escalate(TaskPriority(step));
                highest = highest.max(TaskPriority(step));
                prop_assert_eq!(effective, highest);
                prop_assert_eq!(task.current_priority(), highest);
            }
        }
    }
}

#[cfg(test)]
mod record_tests {
    use super::*;

    fn notification() -> StatusRecord {
        StatusRecord::CancellationNotification {
            handler: Arc::new(|| {}),
            fired: false,
        }
    }

    #[test]
    fn test_records_pop_lifo() {
        let mut chain = StatusChain::default();
        let first = chain.push(notification());
        let second = chain.push(StatusRecord::EscalationNotification {
            handler: Arc::new(|_: TaskPriority| {}),
        });
        assert_eq!(chain.head(), Some(second));
        assert_eq!(chain.len(), 2);

        assert!(matches!(
            chain.remove(first),
            Err(RemoveError::NotHead(RecordKind::CancellationNotification))
        ));
        assert!(chain.remove(second).is_ok());
        assert!(chain.remove(first).is_ok());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_child_record_splices_out_of_order() {
        let mut chain = StatusChain::default();
        let bottom = chain.push(notification());
        let child = chain.push(StatusRecord::ChildTask { first_child: None });
        let top = chain.push(notification());

        assert!(chain.remove(child).is_ok());
        let ids: Vec<_> = chain.ids().into_iter().collect();
        assert_eq!(ids, vec![top, bottom]);
        assert!(chain.remove(top).is_ok());
        assert!(chain.remove(bottom).is_ok());
    }

    #[test]
    fn test_stale_record_id_is_not_found() {
        let mut chain = StatusChain::default();
        let id = chain.push(notification());
        assert!(chain.remove(id).is_ok());
        let reused = chain.push(notification());
        assert_ne!(id, reused);
        assert!(matches!(chain.remove(id), Err(RemoveError::NotFound)));
    }

    #[test]
    fn test_sibling_list() {
        let parent = idle_task();
        let record = parent.add_status_record(StatusRecord::ChildTask { first_child: None });
        let children: Vec<_> = (0..3).map(|_| idle_task()).collect();
        for child in &children {
            add_child_task(&parent, record, child);
        }
        assert_eq!(parent.children_of(record).len(), 3);

        remove_child_task(&parent, record, &children[1]);
        let remaining: Vec<_> = parent.children_of(record).iter().map(TaskRef::id).collect();
        assert_eq!(remaining, vec![children[2].id(), children[0].id()]);

        remove_child_task(&parent, record, &children[2]);
        remove_child_task(&parent, record, &children[0]);
        assert!(parent.children_of(record).is_empty());
        parent.remove_child_record(record);
    }

    #[test]
    fn test_executor_preference_wins() {
        let home = CooperativeExecutor::new();
        let preferred = CooperativeExecutor::new();
        let task = idle_task();
        let record = task.push_executor_preference(as_dyn(&preferred));
        assert_eq!(task.record_kinds(), vec![RecordKind::ExecutorPreference]);

        task.enqueue(&as_dyn(&home));
        assert_eq!(home.pending(), 0);
        assert_eq!(preferred.pending(), 1);

        preferred.run_until_idle();
        assert!(task.is_completed());
        task.pop_executor_preference(record);
        assert!(task.record_kinds().is_empty());
    }
}
