//! Broadcast event flag
//!
//! `set()` wakes every task currently in `wait()`; while the flag stays set
//! further waits return immediately. `clear()` resets it.

use std::cell::Cell;
use std::fmt;

use crate::error::SchedResult;
use crate::sync::waiters::WaiterQueue;

pub struct Event {
    flag: Cell<bool>,
    waiters: WaiterQueue,
}

impl Event {
    /// Create an event with the flag cleared
    pub fn new() -> Self {
        Self {
            flag: Cell::new(false),
            waiters: WaiterQueue::new(),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.get()
    }

    /// Set the flag and wake all waiters
    ///
    /// Setting an already-set event does nothing.
    pub fn set(&self) {
        if !self.flag.replace(true) {
            self.waiters.wake_all();
        }
    }

    pub fn clear(&self) {
        self.flag.set(false);
    }

    /// Wait until the flag is set
    pub async fn wait(&self) -> SchedResult<()> {
        if self.flag.get() {
            return Ok(());
        }
        let mut waiter = self.waiters.enqueue(false);
        waiter.wait().await
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.flag.get())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::tests::{poll_once, CountingWaker};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_wait_when_set_is_immediate() {
        let counter = Arc::new(CountingWaker::default());
        let ev = Event::new();
        ev.set();
        let mut fut = Box::pin(ev.wait());
        assert!(poll_once(&mut fut, &counter).is_ready());
    }

    #[test]
    fn test_set_wakes_all_then_clear() {
        let counter = Arc::new(CountingWaker::default());
        let ev = Event::new();

        let mut a = Box::pin(ev.wait());
        let mut b = Box::pin(ev.wait());
        assert!(poll_once(&mut a, &counter).is_pending());
        assert!(poll_once(&mut b, &counter).is_pending());

        ev.set();
        ev.set();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert!(poll_once(&mut a, &counter).is_ready());
        assert!(poll_once(&mut b, &counter).is_ready());

        ev.clear();
        assert!(!ev.is_set());
        let mut c = Box::pin(ev.wait());
        assert!(poll_once(&mut c, &counter).is_pending());
    }
}
