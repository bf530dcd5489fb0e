//! Single-assignment deferred result
//!
//! A `Deferred<T>` is a shared cell that moves from PENDING to exactly one of
//! DONE (value or error) or CANCELLED, and never leaves that state.
//!
//! ```text
//!            set_result / set_error
//!   PENDING ────────────────────────▶ DONE
//!      │
//!      │ cancel, or awaited by a task with a pending cancellation request
//!      ▼
//!   CANCELLED
//! ```
//!
//! Awaiting a resolved deferred completes immediately. Awaiting a pending one
//! registers the task's waker; every registered waker is woken when the cell
//! resolves. The wakers are called after the internal borrow is released, so
//! a woken task may freely touch the same deferred.
//!
//! There are two ways to await. `deferred.await` moves the outcome out of the
//! cell and suits a single consumer such as a `JoinHandle`. For `T: Clone`,
//! `deferred.wait().await` leaves the outcome in place, so any number of
//! awaiters all see the stored value.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{SchedError, SchedResult};
use crate::tls;

enum State<T> {
    Pending,
    /// `None` once the value has been moved out by an await
    Done(Option<SchedResult<T>>),
    Cancelled,
}

struct Inner<T> {
    state: State<T>,
    wakers: Vec<Waker>,
}

/// Shared handle to a single-assignment result cell
///
/// Cloning the handle shares the cell.
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Deferred<T> {
    /// Create a pending deferred
    pub fn new() -> Self {
        Deferred {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                wakers: Vec::new(),
            })),
        }
    }

    /// True once resolved, either DONE or CANCELLED
    pub fn done(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }

    /// True if CANCELLED
    pub fn cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled)
    }

    /// Resolve with a value
    ///
    /// Fails with `InvalidState` if the deferred is not pending.
    pub fn set_result(&self, value: T) -> SchedResult<()> {
        self.resolve(State::Done(Some(Ok(value))))
    }

    /// Resolve with an error
    pub fn set_error(&self, err: SchedError) -> SchedResult<()> {
        self.resolve(State::Done(Some(Err(err))))
    }

    /// Cancel a pending deferred
    ///
    /// Returns false (and does nothing) if it was already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(State::Cancelled).is_ok()
    }

    /// Move the outcome out without waiting
    ///
    /// `None` while pending. A cancelled deferred yields `Err(Cancelled)`.
    pub fn try_take(&self) -> Option<SchedResult<T>> {
        let mut inner = self.inner.borrow_mut();
        match &mut inner.state {
            State::Pending => None,
            State::Done(slot) => Some(take_slot(slot)),
            State::Cancelled => Some(Err(SchedError::Cancelled)),
        }
    }

    /// Register `waker` to be woken on resolve, once per distinct waker
    fn register(&self, waker: &Waker) {
        let mut inner = self.inner.borrow_mut();
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
    }

    /// True if both handles share the same cell
    pub fn ptr_eq(&self, other: &Deferred<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn resolve(&self, next: State<T>) -> SchedResult<()> {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return Err(SchedError::InvalidState("deferred result is already resolved"));
            }
            inner.state = next;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }
}

impl<T: Clone> Deferred<T> {
    /// Peek at the outcome without consuming it
    pub fn result(&self) -> SchedResult<T> {
        match &self.inner.borrow().state {
            State::Pending => Err(SchedError::InvalidState("result is not ready")),
            State::Done(Some(r)) => r.clone(),
            State::Done(None) => Err(SchedError::InvalidState("result was already taken")),
            State::Cancelled => Err(SchedError::Cancelled),
        }
    }

    /// Wait for the outcome without consuming it
    ///
    /// Every awaiter of the same cell gets a clone of the stored value. Like
    /// the consuming await, this is a suspension point: a pending cancellation
    /// request of the current task cancels the deferred.
    pub async fn wait(&self) -> SchedResult<T> {
        std::future::poll_fn(|cx| {
            if self.done() {
                return Poll::Ready(self.result());
            }
            if tls::take_cancel_request() {
                self.cancel();
                return Poll::Ready(Err(SchedError::Cancelled));
            }
            self.register(cx.waker());
            Poll::Pending
        })
        .await
    }
}

fn take_slot<T>(slot: &mut Option<SchedResult<T>>) -> SchedResult<T> {
    slot.take()
        .unwrap_or(Err(SchedError::InvalidState("result was already taken")))
}

/// Consuming await: the outcome is moved out, so a second await of the same
/// cell reports `InvalidState`. Use [`Deferred::wait`] to share the value.
impl<T> Future for Deferred<T> {
    type Output = SchedResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.try_take() {
            return Poll::Ready(outcome);
        }

        // Suspension point: deliver a pending cancellation request
        if tls::take_cancel_request() {
            self.cancel();
            return Poll::Ready(Err(SchedError::Cancelled));
        }

        self.register(cx.waker());
        Poll::Pending
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred { inner: Rc::clone(&self.inner) }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let state = match inner.state {
            State::Pending => "pending",
            State::Done(_) => "done",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("waiters", &inner.wakers.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::id::TaskId;
    use crate::tls::{enter, TaskContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    /// Waker that counts how often it was woken
    #[derive(Default)]
    pub(crate) struct CountingWaker(pub AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn poll_once<F: Future + Unpin>(fut: &mut F, counter: &Arc<CountingWaker>) -> Poll<F::Output> {
        let waker = Waker::from(Arc::clone(counter));
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn test_set_result_once() {
        let d = Deferred::new();
        assert!(!d.done());
        d.set_result(5).unwrap();
        assert!(d.done());
        assert!(!d.cancelled());
        assert_eq!(d.result(), Ok(5));

        assert_eq!(d.set_result(6), Err(SchedError::InvalidState("deferred result is already resolved")));
        assert!(d.set_error(SchedError::Timeout).is_err());
        assert!(!d.cancel());
        assert_eq!(d.result(), Ok(5));
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let d: Deferred<u32> = Deferred::new();
        assert!(d.cancel());
        assert!(d.done());
        assert!(d.cancelled());
        assert!(d.set_result(1).is_err());
        assert_eq!(d.result(), Err(SchedError::Cancelled));
    }

    #[test]
    fn test_await_done_is_immediate() {
        let counter = Arc::new(CountingWaker::default());
        let d: Deferred<u32> = Deferred::new();
        d.set_error(SchedError::Failed("boom".into())).unwrap();
        for _ in 0..2 {
            let mut wait = Box::pin(d.wait());
            assert_eq!(poll_once(&mut wait, &counter), Poll::Ready(Err(SchedError::Failed("boom".into()))));
        }
        assert_eq!(d.result(), Err(SchedError::Failed("boom".into())));
    }

    #[test]
    fn test_every_waiter_sees_value() {
        let counter = Arc::new(CountingWaker::default());
        let d: Deferred<u32> = Deferred::new();
        let (a, b) = (d.clone(), d.clone());
        let mut wait_a = Box::pin(a.wait());
        let mut wait_b = Box::pin(b.wait());
        assert!(poll_once(&mut wait_a, &counter).is_pending());
        assert!(poll_once(&mut wait_b, &counter).is_pending());

        d.set_result(7).unwrap();
        assert!(counter.0.load(Ordering::SeqCst) >= 1);
        assert_eq!(poll_once(&mut wait_a, &counter), Poll::Ready(Ok(7)));
        assert_eq!(poll_once(&mut wait_b, &counter), Poll::Ready(Ok(7)));

        // Still there for a late waiter
        let mut late = Box::pin(d.wait());
        assert_eq!(poll_once(&mut late, &counter), Poll::Ready(Ok(7)));
    }

    #[test]
    fn test_consuming_await_moves_value() {
        let counter = Arc::new(CountingWaker::default());
        let mut d: Deferred<String> = Deferred::new();
        d.set_result("once".to_string()).unwrap();
        assert_eq!(poll_once(&mut d, &counter), Poll::Ready(Ok("once".to_string())));
        assert_eq!(
            poll_once(&mut d, &counter),
            Poll::Ready(Err(SchedError::InvalidState("result was already taken")))
        );
    }

    #[test]
    fn test_wait_delivers_cancel_request() {
        let counter = Arc::new(CountingWaker::default());
        let token = CancellationToken::new();
        let _g = enter(TaskContext { id: TaskId::new(1), token: token.clone() });

        let d: Deferred<u32> = Deferred::new();
        token.cancel();
        let mut wait = Box::pin(d.wait());
        assert_eq!(poll_once(&mut wait, &counter), Poll::Ready(Err(SchedError::Cancelled)));
        assert!(d.cancelled());
    }

    #[test]
    fn test_pending_wakes_on_resolve() {
        let counter = Arc::new(CountingWaker::default());
        let mut d: Deferred<&str> = Deferred::new();
        let other = d.clone();

        assert!(poll_once(&mut d, &counter).is_pending());
        // Same waker registered only once
        assert!(poll_once(&mut d, &counter).is_pending());

        other.set_result("ok").unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(poll_once(&mut d, &counter), Poll::Ready(Ok("ok")));
    }

    #[test]
    fn test_cancel_request_delivered_at_await() {
        let counter = Arc::new(CountingWaker::default());
        let token = CancellationToken::new();
        let _g = enter(TaskContext { id: TaskId::new(1), token: token.clone() });

        let mut d: Deferred<()> = Deferred::new();
        token.cancel();
        assert_eq!(poll_once(&mut d, &counter), Poll::Ready(Err(SchedError::Cancelled)));
        assert!(d.cancelled());

        // Request consumed: a fresh deferred suspends normally
        let mut d2: Deferred<()> = Deferred::new();
        assert!(poll_once(&mut d2, &counter).is_pending());
    }
}
