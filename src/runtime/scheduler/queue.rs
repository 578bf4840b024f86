//! Job queue for the thread pool
//!
//! Multi-producer, multi-consumer queue with three priority buckets. Higher
//! buckets always drain first; jobs within a bucket run in FIFO order.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::Job;
use crate::runtime::task::{TaskId, TaskPriority};

#[derive(Debug, Default)]
struct Buckets {
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
    closed: bool,
}

impl Buckets {
    fn pop(&mut self) -> Option<Job> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn bucket_mut(
        &mut self,
        bucket: Bucket,
    ) -> &mut VecDeque<Job> {
        match bucket {
            Bucket::High => &mut self.high,
            Bucket::Normal => &mut self.normal,
            Bucket::Low => &mut self.low,
        }
    }
}

/// Which bucket a priority lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    High,
    Normal,
    Low,
}

impl Bucket {
    pub fn of(priority: TaskPriority) -> Bucket {
        if priority >= TaskPriority::HIGH {
            Bucket::High
        } else if priority >= TaskPriority::MEDIUM || priority == TaskPriority::UNSPECIFIED {
            Bucket::Normal
        } else {
            Bucket::Low
        }
    }
}

/// Priority-aware job queue.
#[derive(Debug, Default)]
pub struct JobQueue {
    buckets: Mutex<Buckets>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a job into the bucket of its priority and wake one consumer.
    /// Returns the job back if the queue was closed.
    pub fn push(
        &self,
        job: Job,
    ) -> Result<(), Job> {
        let mut buckets = self.buckets.lock();
        if buckets.closed {
            return Err(job);
        }
        buckets.bucket_mut(Bucket::of(job.priority())).push_back(job);
        drop(buckets);
        self.available.notify_one();
        Ok(())
    }

    /// Move the queued job resuming `task` into the bucket of `priority`.
    /// It goes to the back of that bucket. Returns whether a job moved.
    pub fn escalate(
        &self,
        task: TaskId,
        priority: TaskPriority,
    ) -> bool {
        let target = Bucket::of(priority);
        let mut buckets = self.buckets.lock();
        for bucket in [Bucket::Low, Bucket::Normal] {
            if bucket == target {
                break;
            }
            let queue = buckets.bucket_mut(bucket);
            let Some(index) = queue
                .iter()
                .position(|job| job.task().is_some_and(|queued| queued.id() == task))
            else {
                continue;
            };
            let Some(mut job) = queue.remove(index) else {
                continue;
            };
            job.raise(priority);
            buckets.bucket_mut(target).push_back(job);
            return true;
        }
        false
    }

    /// Pop the highest priority job available.
    pub fn pop(&self) -> Option<Job> {
        self.buckets.lock().pop()
    }

    /// Pop a job, sleeping until one arrives. Returns `None` once the queue
    /// is closed and drained.
    pub fn pop_blocking(&self) -> Option<Job> {
        let mut buckets = self.buckets.lock();
        loop {
            if let Some(job) = buckets.pop() {
                return Some(job);
            }
            if buckets.closed {
                return None;
            }
            self.available.wait(&mut buckets);
        }
    }

    /// Refuse further jobs and wake every sleeping consumer.
    pub fn close(&self) {
        self.buckets.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.buckets.lock().closed
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
