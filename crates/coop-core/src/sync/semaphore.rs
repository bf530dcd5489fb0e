//! Counting semaphores
//!
//! `Semaphore` keeps a non-negative count: `acquire()` takes one permit,
//! suspending in FIFO order while none is available, and `release()` returns
//! one. `BoundedSemaphore` additionally refuses to be released above its
//! initial value, which catches unbalanced release calls.

use std::cell::Cell;
use std::fmt;

use crate::error::{SchedError, SchedResult};
use crate::sync::waiters::WaiterQueue;

pub struct Semaphore {
    value: Cell<usize>,
    waiters: WaiterQueue,
}

impl Semaphore {
    /// Create a semaphore holding `value` permits
    ///
    /// Fails with `InvalidValue` for a negative count.
    pub fn new(value: isize) -> SchedResult<Self> {
        let value = usize::try_from(value)
            .map_err(|_| SchedError::InvalidValue("semaphore initial value must be >= 0"))?;
        Ok(Self {
            value: Cell::new(value),
            waiters: WaiterQueue::new(),
        })
    }

    /// True if `acquire()` would suspend
    pub fn locked(&self) -> bool {
        self.value.get() == 0
    }

    /// Permits currently available
    pub fn value(&self) -> usize {
        self.value.get()
    }

    /// Take a permit without suspending
    pub fn try_acquire(&self) -> bool {
        if self.waiters.is_empty() && self.value.get() > 0 {
            self.value.set(self.value.get() - 1);
            true
        } else {
            false
        }
    }

    /// Take a permit, suspending until one is released
    pub async fn acquire(&self) -> SchedResult<()> {
        if self.try_acquire() {
            return Ok(());
        }

        let mut waiter = self.waiters.enqueue(true);
        waiter.wait().await?;
        let value = self.value.get();
        debug_assert!(value > 0);
        self.value.set(value.saturating_sub(1));
        Ok(())
    }

    /// Return a permit and wake the first pending waiter
    pub fn release(&self) {
        self.value.set(self.value.get() + 1);
        self.waiters.wake_first();
    }

    /// Acquire a permit released automatically on drop
    pub async fn permit(&self) -> SchedResult<SemaphorePermit<'_>> {
        self.acquire().await?;
        Ok(SemaphorePermit { sem: Permits::Plain(self) })
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value.get())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Semaphore that refuses to be released past its initial value
pub struct BoundedSemaphore {
    sem: Semaphore,
    bound: usize,
}

impl BoundedSemaphore {
    pub fn new(value: isize) -> SchedResult<Self> {
        let sem = Semaphore::new(value)?;
        let bound = sem.value();
        Ok(Self { sem, bound })
    }

    pub fn locked(&self) -> bool {
        self.sem.locked()
    }

    pub fn value(&self) -> usize {
        self.sem.value()
    }

    /// Upper limit, equal to the initial value
    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn try_acquire(&self) -> bool {
        self.sem.try_acquire()
    }

    pub async fn acquire(&self) -> SchedResult<()> {
        self.sem.acquire().await
    }

    /// Return a permit
    ///
    /// Fails with `InvalidValue` when the count is already at its bound.
    pub fn release(&self) -> SchedResult<()> {
        if self.sem.value() >= self.bound {
            return Err(SchedError::InvalidValue("BoundedSemaphore released too many times"));
        }
        self.sem.release();
        Ok(())
    }

    pub async fn permit(&self) -> SchedResult<SemaphorePermit<'_>> {
        self.acquire().await?;
        Ok(SemaphorePermit { sem: Permits::Bounded(self) })
    }
}

impl fmt::Debug for BoundedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSemaphore")
            .field("value", &self.sem.value())
            .field("bound", &self.bound)
            .field("waiters", &self.sem.waiters.len())
            .finish()
    }
}

enum Permits<'a> {
    Plain(&'a Semaphore),
    Bounded(&'a BoundedSemaphore),
}

/// One permit, returned on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct SemaphorePermit<'a> {
    sem: Permits<'a>,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        match self.sem {
            Permits::Plain(sem) => sem.release(),
            Permits::Bounded(sem) => {
                if let Err(e) = sem.release() {
                    tracing::warn!(error = %e, "semaphore permit release failed");
                }
            }
        }
    }
}
