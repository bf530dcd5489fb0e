//! Timer heap for `call_later` / `call_at`
//!
//! Min-heap ordered by deadline, ties broken by insertion order so timers
//! with equal deadlines fire FIFO.
//!
//! # Cancellation Strategy
//!
//! Lazy: cancelling removes the callback from the map and leaves the heap
//! entry behind. Entries without a callback are skipped when they reach the
//! top of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

/// Timer callback, run on the scheduler thread
pub type TimerCallback = Box<dyn FnOnce()>;

/// Global timer handle counter
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies a scheduled timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    fn next() -> Self {
        TimerHandle(NEXT_HANDLE.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

struct HeapEntry {
    deadline: Instant,
    handle: TimerHandle,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; handles increase, so ties fire FIFO
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    callbacks: HashMap<TimerHandle, TimerCallback>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, deadline: Instant, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::next();
        self.heap.push(HeapEntry { deadline, handle });
        self.callbacks.insert(handle, callback);
        self.total_inserted += 1;
        handle
    }

    /// Returns false if the timer already fired or was cancelled
    pub(crate) fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.callbacks.remove(&handle).is_some();
        if removed {
            self.total_cancelled += 1;
        }
        if self.callbacks.is_empty() {
            self.heap.clear();
        }
        removed
    }

    /// Remove and return the callbacks due at `now`, in deadline order
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let handle = top.handle;
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&handle) {
                self.total_fired += 1;
                expired.push(cb);
            }
        }
        expired
    }

    /// Earliest live deadline
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.callbacks.contains_key(&top.handle) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Live (not cancelled, not fired) timers
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drop all pending callbacks
    pub(crate) fn clear(&mut self) -> Vec<TimerCallback> {
        self.heap.clear();
        self.callbacks.drain().map(|(_, cb)| cb).collect()
    }

    pub(crate) fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.callbacks.len(),
            pending_cancellations: self.heap.len().saturating_sub(self.callbacks.len()),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

/// Timer statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    /// Live timers
    pub active: usize,
    /// Cancelled entries still in the heap
    pub pending_cancellations: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, v: u32) -> TimerCallback {
        let log = Rc::clone(log);
        Box::new(move || log.borrow_mut().push(v))
    }

    #[test]
    fn test_ordering_and_ties() {
        let mut timers = TimerHeap::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        timers.insert(now + Duration::from_millis(30), recorder(&log, 3));
        timers.insert(now + Duration::from_millis(10), recorder(&log, 1));
        timers.insert(now + Duration::from_millis(10), recorder(&log, 2));

        for cb in timers.pop_expired(now + Duration::from_millis(50)) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_not_yet_due() {
        let mut timers = TimerHeap::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        timers.insert(now + Duration::from_secs(1), recorder(&log, 1));

        assert!(timers.pop_expired(now).is_empty());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerHeap::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        let h1 = timers.insert(now, recorder(&log, 1));
        timers.insert(now + Duration::from_millis(5), recorder(&log, 2));

        assert!(timers.cancel(h1));
        assert!(!timers.cancel(h1));
        // Cancelled head is skipped
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));

        for cb in timers.pop_expired(now + Duration::from_secs(1)) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![2]);

        let stats = timers.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_fired, 1);
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.pending_cancellations, 0);
    }
}
