//! Condition variable bound to a `Lock`
//!
//! ```text
//!   task A                         task B
//!   lock.acquire()
//!   cond.wait() ── release ──▶     lock.acquire()
//!      (queued)                    cond.notify(1)
//!                                  lock.release()
//!   ◀── reacquire ──
//!   returns holding the lock
//! ```
//!
//! `wait()` reacquires the lock on every exit path that reaches it,
//! including cancellation. A cancellation delivered during the reacquire is
//! held back until the lock is held again and then reported.

use std::fmt;
use std::rc::Rc;

use crate::error::{SchedError, SchedResult};
use crate::sync::lock::{Lock, LockGuard};
use crate::sync::waiters::WaiterQueue;
use crate::tls;

pub struct Condition {
    lock: Rc<Lock>,
    waiters: WaiterQueue,
}

impl Condition {
    /// Create a condition with its own lock
    pub fn new() -> Self {
        Self::with_lock(Rc::new(Lock::new()))
    }

    /// Create a condition sharing an existing lock
    pub fn with_lock(lock: Rc<Lock>) -> Self {
        Self {
            lock,
            waiters: WaiterQueue::new(),
        }
    }

    pub fn shared_lock(&self) -> &Rc<Lock> {
        &self.lock
    }

    pub fn locked(&self) -> bool {
        self.lock.locked()
    }

    pub async fn acquire(&self) -> SchedResult<()> {
        self.lock.acquire().await
    }

    pub fn release(&self) -> SchedResult<()> {
        self.lock.release()
    }

    pub async fn lock(&self) -> SchedResult<LockGuard<'_>> {
        self.lock.lock().await
    }

    /// Release the lock, wait for a notification, reacquire
    ///
    /// Fails with `IllegalState` if the calling task does not hold the lock.
    pub async fn wait(&self) -> SchedResult<()> {
        self.check_owner("cannot wait on un-acquired lock")?;
        self.lock.release()?;

        let outcome = {
            let mut waiter = self.waiters.enqueue(false);
            waiter.wait().await
        };

        let mut cancelled = false;
        loop {
            match self.lock.acquire().await {
                Ok(()) => break,
                Err(SchedError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }

        outcome?;
        if cancelled {
            return Err(SchedError::Cancelled);
        }
        Ok(())
    }

    /// Wait until `predicate` yields a value
    ///
    /// The predicate is evaluated first without waiting, then after each
    /// wakeup, always with the lock held.
    pub async fn wait_for<R, F>(&self, mut predicate: F) -> SchedResult<R>
    where
        F: FnMut() -> Option<R>,
    {
        loop {
            if let Some(r) = predicate() {
                return Ok(r);
            }
            self.wait().await?;
        }
    }

    /// Wake up to `n` waiters, returning how many were woken
    pub fn notify(&self, n: usize) -> SchedResult<usize> {
        self.check_owner("cannot notify on un-acquired lock")?;
        Ok(self.waiters.wake(n))
    }

    pub fn notify_all(&self) -> SchedResult<usize> {
        self.notify(usize::MAX)
    }

    fn check_owner(&self, msg: &'static str) -> SchedResult<()> {
        if self.lock.locked() && self.lock.owner() == tls::current_task_id() {
            Ok(())
        } else {
            Err(SchedError::IllegalState(msg))
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("lock", &self.lock)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::tests::{poll_once, CountingWaker};
    use std::sync::Arc;

    #[test]
    fn test_requires_lock() {
        let counter = Arc::new(CountingWaker::default());
        let cond = Condition::new();

        let mut fut = Box::pin(cond.wait());
        assert_eq!(
            poll_once(&mut fut, &counter),
            std::task::Poll::Ready(Err(SchedError::IllegalState("cannot wait on un-acquired lock")))
        );
        assert_eq!(
            cond.notify(1),
            Err(SchedError::IllegalState("cannot notify on un-acquired lock"))
        );
    }

    #[test]
    fn test_wait_notify_reacquires() {
        let counter = Arc::new(CountingWaker::default());
        let cond = Condition::new();
        assert!(cond.shared_lock().try_acquire());

        let mut fut = Box::pin(cond.wait());
        assert!(poll_once(&mut fut, &counter).is_pending());
        assert!(!cond.locked());

        assert!(cond.shared_lock().try_acquire());
        assert_eq!(cond.notify(1).unwrap(), 1);
        assert_eq!(cond.notify(1).unwrap(), 0);
        cond.release().unwrap();

        assert!(poll_once(&mut fut, &counter).is_ready());
        assert!(cond.locked());
    }

    #[test]
    fn test_wait_for_immediate() {
        let counter = Arc::new(CountingWaker::default());
        let cond = Condition::new();
        let mut fut = Box::pin(cond.wait_for(|| Some(42)));
        assert_eq!(poll_once(&mut fut, &counter), std::task::Poll::Ready(Ok(42)));
    }
}
