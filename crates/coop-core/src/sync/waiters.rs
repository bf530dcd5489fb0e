//! FIFO waiter queue shared by all primitives
//!
//! Each suspended caller owns a `Waiter` whose deferred result also sits in
//! the queue. The queue only ever *resolves* entries; removal is done by the
//! waiter itself when it is dropped, which covers every exit path: normal
//! wakeup, cancellation delivered while suspended, and the waiting future
//! being dropped outright.
//!
//! ```text
//!   queue:  [ w1 (done) | w2 (cancelled) | w3 (pending) | w4 (pending) ]
//!   wake_first()  -> resolves w3   (done and cancelled entries are skipped)
//!   wake(2)       -> resolves w3, w4
//! ```
//!
//! A waiter created with `pass_on` hands its wakeup to the next pending
//! entry if it is dropped after being resolved but before its owner observed
//! the wakeup. Lock and semaphore waiters use this; without it a permit
//! released to an abandoned waiter would be lost.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::deferred::Deferred;
use crate::error::SchedResult;

struct Entry {
    key: u64,
    deferred: Deferred<()>,
}

#[derive(Default)]
pub(crate) struct WaiterQueue {
    entries: RefCell<VecDeque<Entry>>,
    next_key: Cell<u64>,
}

impl WaiterQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a pending entry and return its owning waiter
    pub(crate) fn enqueue(&self, pass_on: bool) -> Waiter<'_> {
        let key = self.next_key.get();
        self.next_key.set(key.wrapping_add(1));

        let deferred = Deferred::new();
        self.entries.borrow_mut().push_back(Entry {
            key,
            deferred: deferred.clone(),
        });

        Waiter {
            queue: self,
            key,
            deferred,
            pass_on,
            consumed: false,
        }
    }

    /// Resolve the first entry that is still pending
    pub(crate) fn wake_first(&self) -> bool {
        self.wake(1) == 1
    }

    /// Resolve up to `n` pending entries in FIFO order
    ///
    /// Entries that are already resolved or cancelled are skipped and not
    /// counted. Returns the number resolved.
    pub(crate) fn wake(&self, n: usize) -> usize {
        let targets: Vec<Deferred<()>> = self
            .entries
            .borrow()
            .iter()
            .filter(|e| !e.deferred.done())
            .take(n)
            .map(|e| e.deferred.clone())
            .collect();

        targets
            .iter()
            .filter(|d| d.set_result(()).is_ok())
            .count()
    }

    pub(crate) fn wake_all(&self) -> usize {
        self.wake(usize::MAX)
    }

    /// Entries still in the queue, including resolved ones not yet removed
    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn remove(&self, key: u64) {
        let mut entries = self.entries.borrow_mut();
        if let Some(pos) = entries.iter().position(|e| e.key == key) {
            entries.remove(pos);
        }
    }
}

/// A caller's place in a `WaiterQueue`
pub(crate) struct Waiter<'a> {
    queue: &'a WaiterQueue,
    key: u64,
    deferred: Deferred<()>,
    pass_on: bool,
    consumed: bool,
}

impl Waiter<'_> {
    /// Suspend until resolved
    ///
    /// Fails with `Cancelled` if the calling task's cancellation request is
    /// delivered here.
    pub(crate) async fn wait(&mut self) -> SchedResult<()> {
        let outcome = self.deferred.clone().await;
        if outcome.is_ok() {
            self.consumed = true;
        }
        outcome
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.key);

        let abandoned_wakeup = self.deferred.done() && !self.deferred.cancelled() && !self.consumed;
        if self.pass_on && abandoned_wakeup {
            self.queue.wake_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::tests::{poll_once, CountingWaker};
    use std::sync::Arc;

    #[test]
    fn test_wake_counts_pending_only() {
        let q = WaiterQueue::new();
        let w1 = q.enqueue(false);
        let w2 = q.enqueue(false);
        let _w3 = q.enqueue(false);

        w2.deferred.cancel();
        assert_eq!(q.wake(2), 2);
        assert!(w1.deferred.done());
        assert_eq!(q.wake(5), 0);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_drop_removes_entry() {
        let q = WaiterQueue::new();
        {
            let _w1 = q.enqueue(false);
            let _w2 = q.enqueue(false);
            assert_eq!(q.len(), 2);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_wait_consumes_wakeup() {
        let counter = Arc::new(CountingWaker::default());
        let q = WaiterQueue::new();
        let mut w1 = q.enqueue(true);
        let w2 = q.enqueue(true);

        {
            let mut fut = Box::pin(w1.wait());
            assert!(poll_once(&mut fut, &counter).is_pending());
            assert!(q.wake_first());
            assert!(poll_once(&mut fut, &counter).is_ready());
        }
        drop(w1);
        // w1 observed its wakeup, nothing is passed on
        assert!(!w2.deferred.done());
    }

    #[test]
    fn test_abandoned_wakeup_passes_on() {
        let q = WaiterQueue::new();
        let w1 = q.enqueue(true);
        let w2 = q.enqueue(true);

        assert!(q.wake_first());
        drop(w1);
        assert!(w2.deferred.done());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_no_pass_on_without_flag() {
        let q = WaiterQueue::new();
        let w1 = q.enqueue(false);
        let w2 = q.enqueue(false);

        q.wake_first();
        drop(w1);
        assert!(!w2.deferred.done());
    }
}
