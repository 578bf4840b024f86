//! Executor integration tests
//!
//! The same structured programs run on every executor kind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::runtime::scheduler::{is_current_executor, Executor, ExecutorKind};
use weft::runtime::{
    sleep, timeout, with_continuation, with_task_group, yield_now, AsyncLet, GroupMode, Runtime,
    TaskOptions,
};
use weft::util::config::RuntimeConfig;

const KINDS: [ExecutorKind; 3] = [
    ExecutorKind::ThreadPool,
    ExecutorKind::Cooperative,
    ExecutorKind::ThreadPerTask,
];

fn runtime(kind: ExecutorKind) -> Runtime {
    let config = RuntimeConfig {
        executor: kind,
        workers: 2,
        ..RuntimeConfig::default()
    };
    Runtime::from_config(config).unwrap()
}

#[test]
fn test_group_sum_on_every_executor() {
    for kind in KINDS {
        let runtime = runtime(kind);
        assert_eq!(runtime.kind(), kind);
        let total = runtime
            .block_on(|current| async move {
                with_task_group(&current, GroupMode::Accumulating, |group| async move {
                    for n in 1..=10u64 {
                        group.spawn(TaskOptions::new(), move |_| async move { Ok(n) });
                    }
                    let mut total = 0;
                    while let Some(value) = group.next().await {
                        total += value?;
                    }
                    Ok(total)
                })
                .await
            })
            .unwrap();
        assert_eq!(total, 55, "executor {}", kind);
        runtime.shutdown();
    }
}

#[test]
fn test_async_let_and_sleep_on_every_executor() {
    for kind in KINDS {
        let runtime = runtime(kind);
        let value = runtime
            .block_on(|current| async move {
                let slow = AsyncLet::begin(&current, TaskOptions::new(), |_| async {
                    sleep(Duration::from_millis(10)).await;
                    Ok(40u32)
                });
                let fast = AsyncLet::begin(&current, TaskOptions::new(), |_| async { Ok(2u32) });
                Ok(slow.consume().await? + fast.consume().await?)
            })
            .unwrap();
        assert_eq!(value, 42, "executor {}", kind);
        runtime.shutdown();
    }
}

#[test]
fn test_continuation_resumed_from_foreign_thread() {
    for kind in KINDS {
        let runtime = runtime(kind);
        let value = runtime
            .block_on(|_| async {
                with_continuation(|continuation| {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(5));
                        continuation.resume(String::from("resumed"));
                    });
                })
                .await
            })
            .unwrap();
        assert_eq!(value, "resumed", "executor {}", kind);
        runtime.shutdown();
    }
}

#[test]
fn test_timeout_inside_task() {
    let runtime = runtime(ExecutorKind::ThreadPool);
    let (late, early) = runtime
        .block_on(|_| async {
            let late = timeout(Duration::from_millis(5), sleep(Duration::from_secs(5))).await;
            let early = timeout(Duration::from_secs(5), async { 7u8 }).await;
            Ok((late.is_err(), early.ok()))
        })
        .unwrap();
    assert!(late);
    assert_eq!(early, Some(7));
    runtime.shutdown();
}

#[test]
fn test_spawned_tasks_finish_independently() {
    let runtime = runtime(ExecutorKind::ThreadPool);
    let tasks: Vec<_> = (0..16u64)
        .map(|n| runtime.spawn(move |_| async move { Ok(n * n) }))
        .collect();
    let total: u64 = tasks
        .into_iter()
        .map(|task| runtime.wait(task).unwrap())
        .sum();
    assert_eq!(total, (0..16u64).map(|n| n * n).sum::<u64>());
    runtime.shutdown();
}

#[test]
fn test_group_children_share_a_serial_executor() {
    let runtime = runtime(ExecutorKind::ThreadPool);
    let serial: Arc<dyn Executor> = runtime.serial_executor("ledger");
    let active = Arc::new(AtomicUsize::new(0));
    let widest = Arc::new(AtomicUsize::new(0));

    let (home, busy, peak) = (serial.clone(), active.clone(), widest.clone());
    let on_serial = runtime
        .block_on(move |current| async move {
            with_task_group(&current, GroupMode::Accumulating, |group| async move {
                for _ in 0..40 {
                    let (home, busy, peak) = (home.clone(), busy.clone(), peak.clone());
                    group.spawn(TaskOptions::new().executor(home.clone()), move |_| async move {
                        for _ in 0..3 {
                            let now = busy.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(20));
                            busy.fetch_sub(1, Ordering::SeqCst);
                            yield_now().await;
                        }
                        Ok(is_current_executor(&home))
                    });
                }
                let mut on_serial = 0;
                while let Some(result) = group.next().await {
                    if result? {
                        on_serial += 1;
                    }
                }
                Ok(on_serial)
            })
            .await
        })
        .unwrap();

    assert_eq!(on_serial, 40);
    assert_eq!(widest.load(Ordering::SeqCst), 1);
    runtime.shutdown();
}
