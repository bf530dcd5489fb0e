//! Sleeping and timeouts
//!
//! `timeout` works by scheduling a cancellation of the calling task:
//!
//! ```text
//!   timeout(d, op)
//!     ├─ call_later(d, cancel current task)
//!     ├─ op.await ──────────────┬─ finished first: cancel the timer, return
//!     │                         └─ timer fired: op sees Cancelled
//!     └─ Cancelled after the timer fired ──▶ Err(Timeout)
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use coop_core::{tls as task_tls, SchedError, SchedResult};

use crate::scheduler::Handle;
use crate::timer::TimerHandle;
use crate::tls;

/// Suspend the current task for `duration`
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

/// Suspend the current task until `deadline`
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
        state: Rc::new(SleepState::default()),
    }
}

#[derive(Default)]
struct SleepState {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Future returned by `sleep`
///
/// Fails with `Cancelled` if the task's cancellation is delivered while it
/// sleeps, or `NotRunning` outside a scheduler.
pub struct Sleep {
    deadline: Instant,
    timer: Option<(Handle, TimerHandle)>,
    state: Rc<SleepState>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn disarm(&mut self) {
        if let Some((handle, timer)) = self.timer.take() {
            handle.cancel_timer(timer);
        }
    }
}

impl Future for Sleep {
    type Output = SchedResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if task_tls::take_cancel_request() {
            self.disarm();
            return Poll::Ready(Err(SchedError::Cancelled));
        }
        if self.state.fired.get() || Instant::now() >= self.deadline {
            self.timer = None;
            return Poll::Ready(Ok(()));
        }

        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        if self.timer.is_none() {
            let handle = match tls::current() {
                Ok(h) => h,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let state = Rc::clone(&self.state);
            let timer = handle.call_at(self.deadline, move || {
                state.fired.set(true);
                if let Some(w) = state.waker.borrow_mut().take() {
                    w.wake();
                }
            });
            self.timer = Some((handle, timer));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if !self.state.fired.get() {
            self.disarm();
        }
    }
}

/// Run `operation`, failing with `Timeout` if it takes longer than `duration`
///
/// On timeout the operation is cancelled at its current suspension point and
/// allowed to run its cleanup before this returns. Must be called from a task.
pub async fn timeout<F, T>(duration: Duration, operation: F) -> SchedResult<T>
where
    F: Future<Output = SchedResult<T>>,
{
    let handle = tls::current()?;
    let token = task_tls::current_token().ok_or(SchedError::NoCurrentTask)?;
    let waker = std::future::poll_fn(|cx| Poll::Ready(cx.waker().clone())).await;

    let fired = Rc::new(Cell::new(false));
    let timer = {
        let fired = Rc::clone(&fired);
        let token = token.clone();
        handle.call_later(duration, move || {
            fired.set(true);
            token.cancel();
            waker.wake();
        })
    };
    let guard = TimerGuard { handle, timer };

    let outcome = operation.await;
    drop(guard);

    if !fired.get() {
        return outcome;
    }
    match outcome {
        Err(SchedError::Cancelled) => Err(SchedError::Timeout),
        other => {
            // The operation finished before reaching a suspension point
            // that would have observed the cancellation
            token.take_request();
            other
        }
    }
}

struct TimerGuard {
    handle: Handle,
    timer: TimerHandle,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.cancel_timer(self.timer);
    }
}
