//! Task wakers
//!
//! One `TaskWaker` per task. The `queued` flag keeps a task in the ready
//! queue at most once no matter how many times it is woken before it runs;
//! the scheduler clears it right before polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Wake;

use coop_core::TaskId;

use crate::ready_queue::ReadyQueue;

pub(crate) struct TaskWaker {
    id: TaskId,
    queued: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl TaskWaker {
    /// Create a waker for a task that is already in the ready queue
    pub(crate) fn new_queued(id: TaskId, ready: Arc<ReadyQueue>) -> Self {
        Self {
            id,
            queued: AtomicBool::new(true),
            ready,
        }
    }

    /// Called by the scheduler right before polling
    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.ready.push(self.id);
        }
    }
}
