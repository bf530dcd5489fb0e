//! Thread-local handle to the running scheduler
//!
//! Set for the duration of `run_until` / `run_forever`, so free functions
//! like `spawn` and `sleep` find their loop without threading a handle
//! through every call.

use std::cell::RefCell;

use coop_core::{SchedError, SchedResult};

use crate::scheduler::Handle;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Restores the previous handle when dropped
pub(crate) struct EnterGuard {
    prev: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

pub(crate) fn enter(handle: Handle) -> EnterGuard {
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(handle));
    EnterGuard { prev }
}

/// Handle of the scheduler running on this thread
///
/// Fails with `NotRunning` outside `run_until` / `run_forever`.
pub fn current() -> SchedResult<Handle> {
    try_current().ok_or(SchedError::NotRunning)
}

#[inline]
pub fn try_current() -> Option<Handle> {
    CURRENT.with(|cell| cell.borrow().clone())
}
