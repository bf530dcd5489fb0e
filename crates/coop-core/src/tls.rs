//! Thread-local storage for the current task context
//!
//! The scheduler installs a `TaskContext` for the duration of each poll.
//! Primitives read it to learn which task is calling (Condition ownership
//! checks) and whether a cancellation request is waiting to be delivered.

use std::cell::RefCell;
use crate::cancel::CancellationToken;
use crate::id::TaskId;

/// Identity and cancellation token of the task being polled
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub id: TaskId,
    pub token: CancellationToken,
}

thread_local! {
    /// Task currently being polled on this thread
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped
#[must_use = "the context is uninstalled when the guard is dropped"]
pub struct ContextGuard {
    prev: Option<TaskContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Install `ctx` as the current task until the guard drops
#[inline]
pub fn enter(ctx: TaskContext) -> ContextGuard {
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

/// Get the current task ID
///
/// Returns `TaskId::NONE` if not running in a task.
#[inline]
pub fn current_task_id() -> TaskId {
    CURRENT.with(|cell| cell.borrow().as_ref().map_or(TaskId::NONE, |c| c.id))
}

/// Get the current task's cancellation token
#[inline]
pub fn current_token() -> Option<CancellationToken> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|c| c.token.clone()))
}

/// Check if we're running inside a task
#[inline]
pub fn is_in_task() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

/// Consume the current task's pending cancellation request
///
/// Called by every suspension point before it parks the task.
#[inline]
pub fn take_cancel_request() -> bool {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .is_some_and(|c| c.token.take_request())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_task() {
        assert!(!is_in_task());
        assert_eq!(current_task_id(), TaskId::NONE);
        assert!(current_token().is_none());
        assert!(!take_cancel_request());
    }

    #[test]
    fn test_enter_nests_and_restores() {
        let outer = TaskContext { id: TaskId::new(1), token: CancellationToken::new() };
        let inner = TaskContext { id: TaskId::new(2), token: CancellationToken::new() };

        let g1 = enter(outer);
        assert_eq!(current_task_id(), TaskId::new(1));
        {
            let _g2 = enter(inner);
            assert_eq!(current_task_id(), TaskId::new(2));
        }
        assert_eq!(current_task_id(), TaskId::new(1));
        drop(g1);
        assert!(!is_in_task());
    }

    #[test]
    fn test_take_cancel_request() {
        let token = CancellationToken::new();
        let _g = enter(TaskContext { id: TaskId::new(3), token: token.clone() });

        token.cancel();
        assert!(take_cancel_request());
        assert!(!take_cancel_request());
    }
}
