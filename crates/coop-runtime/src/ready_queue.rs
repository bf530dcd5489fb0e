//! Ready queue of task ids
//!
//! Wakers may fire on any thread, so the queue is a lock-free `SegQueue`.
//! A push from a thread other than the scheduler's also signals the
//! notifier, so a loop blocked in the reactor picks the task up.
//!
//! The scheduler drains a *snapshot* each iteration: ids pushed while that
//! snapshot is being polled wait for the next iteration.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use coop_core::TaskId;
use crossbeam_queue::SegQueue;

use crate::reactor::Notifier;

pub(crate) struct ReadyQueue {
    queue: SegQueue<TaskId>,
    owner: ThreadId,
    notifier: Arc<Notifier>,
}

impl ReadyQueue {
    pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            queue: SegQueue::new(),
            owner: thread::current().id(),
            notifier,
        }
    }

    pub(crate) fn push(&self, id: TaskId) {
        self.queue.push(id);
        if thread::current().id() != self.owner {
            if let Err(e) = self.notifier.notify() {
                tracing::error!(error = %e, "scheduler notifier write failed");
            }
        }
    }

    /// Pop up to `budget` ids queued before this call
    pub(crate) fn snapshot(&self, budget: usize) -> Vec<TaskId> {
        let n = self.queue.len().min(budget);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.queue.pop() {
                Some(id) => out.push(id),
                None => break,
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_fifo_and_budget() {
        let q = ReadyQueue::new(Arc::new(Notifier::new().unwrap()));
        for i in 0..5 {
            q.push(TaskId::new(i));
        }
        let first = q.snapshot(3);
        assert_eq!(first, vec![TaskId::new(0), TaskId::new(1), TaskId::new(2)]);
        assert_eq!(q.len(), 2);

        q.push(TaskId::new(9));
        assert_eq!(q.snapshot(10), vec![TaskId::new(3), TaskId::new(4), TaskId::new(9)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_foreign_push() {
        let q = Arc::new(ReadyQueue::new(Arc::new(Notifier::new().unwrap())));
        let remote = Arc::clone(&q);
        std::thread::spawn(move || remote.push(TaskId::new(7)))
            .join()
            .unwrap();
        assert_eq!(q.snapshot(10), vec![TaskId::new(7)]);
    }
}
