//! Cancellation token for cooperative cancellation
//!
//! Every task owns a token. Cancelling it records a one-shot *request*: the
//! next suspension point the task reaches consumes the request and returns
//! `Err(SchedError::Cancelled)`. Consuming the request is what lets cleanup
//! code that itself suspends (for example `Condition::wait` reacquiring its
//! lock) run to completion after the cancellation was observed.
//!
//! Tokens are single-threaded (`Rc`) like everything else a task touches.

use std::cell::Cell;
use std::rc::Rc;
use crate::error::{SchedError, SchedResult};

/// Token for checking and triggering cancellation
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Rc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    /// Pending request, consumed by the next suspension point
    requested: Cell<bool>,

    /// Sticky flag: cancel() was called at least once since the last reset
    cancelled: Cell<bool>,
}

impl CancellationToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    ///
    /// Idempotent while a request is still pending.
    pub fn cancel(&self) {
        self.inner.requested.set(true);
        self.inner.cancelled.set(true);
    }

    /// Check if cancellation was ever requested (since the last reset)
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Check if a request is pending delivery
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.get()
    }

    /// Consume the pending request, if any
    #[inline]
    pub fn take_request(&self) -> bool {
        self.inner.requested.replace(false)
    }

    /// Consume the pending request and turn it into an error
    ///
    /// ```ignore
    /// async fn crunch(token: &CancellationToken) -> SchedResult<()> {
    ///     for chunk in work {
    ///         token.check()?;
    ///         process(chunk);
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[inline]
    pub fn check(&self) -> SchedResult<()> {
        if self.take_request() {
            Err(SchedError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Withdraw a pending request and clear the sticky flag
    pub fn reset(&self) {
        self.inner.requested.set(false);
        self.inner.cancelled.set(false);
    }

    /// True if both tokens share the same state
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("requested", &self.is_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cancellation() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(SchedError::Cancelled));
    }

    #[test]
    fn test_request_is_one_shot() {
        let token = CancellationToken::new();
        token.cancel();

        assert!(token.take_request());
        assert!(!token.take_request());
        // Sticky flag survives delivery
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reset() {
        let token = CancellationToken::new();
        token.cancel();
        token.reset();
        assert!(!token.is_cancelled());
        assert!(!token.is_requested());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
        assert!(token1.same_as(&token2));
        assert!(!token1.same_as(&CancellationToken::new()));
    }
}
