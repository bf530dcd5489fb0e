//! Single-threaded cooperative scheduler
//!
//! One loop iteration:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ 1. run expired timers                                    │
//!   │ 2. run call_soon callbacks queued before this point      │
//!   │ 3. poll a snapshot of the ready queue, each task once    │
//!   │ 4. wait for I/O:                                         │
//!   │      0        if anything is ready or stopping           │
//!   │      deadline of the next timer, otherwise               │
//!   │      forever  if there are no timers                     │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A task woken during step 3 runs no earlier than the next iteration.
//!
//! Tasks are `!Send` futures owned by the scheduler. A task is polled inside
//! a `coop_core::tls` context carrying its id and cancellation token, which
//! is how primitives deliver cancellation at suspension points.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use coop_core::tls::TaskContext;
use coop_core::{CancellationToken, Deferred, SchedError, SchedResult, TaskId};

use crate::config::{ConfigError, RuntimeConfig};
use crate::reactor::{Notifier, Reactor};
use crate::ready_queue::ReadyQueue;
use crate::timer::{TimerCallback, TimerHandle, TimerHeap, TimerStats};
use crate::tls;
use crate::waker::TaskWaker;

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;
type Callback = Box<dyn FnOnce()>;

struct TaskSlot {
    /// `None` while the task is being polled
    future: Option<TaskFuture>,
    waker: Arc<TaskWaker>,
    token: CancellationToken,
    started: bool,
    /// Resolves the task's JoinHandle with an error
    abort: Box<dyn FnOnce(SchedError)>,
}

struct Shared {
    config: RuntimeConfig,
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    next_id: Cell<u64>,
    ready: Arc<ReadyQueue>,
    notifier: Arc<Notifier>,
    timers: RefCell<TimerHeap>,
    reactor: RefCell<Reactor>,
    soon: RefCell<VecDeque<Callback>>,
    running: Cell<bool>,
    stopping: Cell<bool>,
    remote_stop: Arc<AtomicBool>,
}

/// Owns the loop. Dropping it drops every unfinished task.
pub struct Scheduler {
    handle: Handle,
}

/// Cheap, cloneable reference to a scheduler, usable from its tasks
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Scheduler {
    /// Scheduler configured from the environment
    pub fn new() -> SchedResult<Self> {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(config: RuntimeConfig) -> SchedResult<Self> {
        config.validate().map_err(|e| match e {
            ConfigError::InvalidValue(msg) => SchedError::InvalidValue(msg),
        })?;

        let notifier = Arc::new(Notifier::new()?);
        let reactor = Reactor::new(Arc::clone(&notifier), config.io_events)?;
        let ready = Arc::new(ReadyQueue::new(Arc::clone(&notifier)));

        tracing::debug!(
            io_events = config.io_events,
            tick_budget = config.tick_budget,
            debug = config.debug,
            "scheduler created"
        );

        Ok(Self {
            handle: Handle {
                shared: Rc::new(Shared {
                    config,
                    tasks: RefCell::new(HashMap::new()),
                    next_id: Cell::new(0),
                    ready,
                    notifier,
                    timers: RefCell::new(TimerHeap::new()),
                    reactor: RefCell::new(reactor),
                    soon: RefCell::new(VecDeque::new()),
                    running: Cell::new(false),
                    stopping: Cell::new(false),
                    remote_stop: Arc::new(AtomicBool::new(false)),
                }),
            },
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.handle.spawn(future)
    }

    /// Run the loop until `future` completes and return its output
    ///
    /// `future` runs as a task of its own. Fails with `Stalled` when it can
    /// never complete: no task is ready, and there are no callbacks, timers
    /// or I/O registrations left to wake anything.
    pub fn run_until<F>(&self, future: F) -> SchedResult<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let _running = self.handle.enter_loop()?;
        let main = self.handle.spawn(future);

        loop {
            self.handle.tick();
            if let Some(outcome) = main.try_take() {
                return outcome;
            }
            if self.handle.is_stalled() {
                tracing::warn!(task = %main.id(), "run_until stalled");
                main.cancel();
                return Err(SchedError::Stalled);
            }
            self.handle.park()?;
        }
    }

    /// Run until `stop()` is called
    pub fn run_forever(&self) -> SchedResult<()> {
        let _running = self.handle.enter_loop()?;
        loop {
            self.handle.tick();
            if self.handle.shared.stopping.get() {
                break;
            }
            self.handle.park()?;
        }
        self.handle.shared.stopping.set(false);
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.handle.task_count())
            .field("running", &self.handle.is_running())
            .finish()
    }
}

/// Clears the running flag on every exit path
struct RunningGuard {
    shared: Rc<Shared>,
    _tls: tls::EnterGuard,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.running.set(false);
    }
}

impl Handle {
    /// Spawn a task; it first runs on the next loop iteration
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let shared = &self.shared;
        let id = TaskId::new(shared.next_id.get());
        shared.next_id.set(id.as_u64() + 1);

        let result = Deferred::new();
        let token = CancellationToken::new();
        let waker = Arc::new(TaskWaker::new_queued(id, Arc::clone(&shared.ready)));

        let cell = result.clone();
        let body = async move {
            let output = future.await;
            // Fails only if the handle was cancelled by its awaiter
            let _ = cell.set_result(output);
        };
        let cell = result.clone();
        let abort = Box::new(move |err: SchedError| {
            if err.is_cancelled() {
                cell.cancel();
            } else {
                let _ = cell.set_error(err);
            }
        });

        shared.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                future: Some(Box::pin(body)),
                waker: Arc::clone(&waker),
                token: token.clone(),
                started: false,
                abort,
            },
        );
        shared.ready.push(id);
        tracing::trace!(task = %id, "task spawned");

        JoinHandle { id, result, token, waker }
    }

    /// Run `callback` on the next loop iteration
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) {
        self.shared.soon.borrow_mut().push_back(Box::new(callback));
    }

    /// Run `callback` after `delay`
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.call_at(Instant::now() + delay, callback)
    }

    /// Run `callback` at `deadline`
    pub fn call_at(&self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let cb: TimerCallback = Box::new(callback);
        self.shared.timers.borrow_mut().insert(deadline, cb)
    }

    /// Returns false if the timer already fired or was cancelled
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.shared.timers.borrow_mut().cancel(handle)
    }

    /// The loop's clock
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    /// Stop `run_forever` after the current iteration
    pub fn stop(&self) {
        self.shared.stopping.set(true);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    /// Thread-safe handle that can stop the loop from anywhere
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.shared.remote_stop),
            notifier: Arc::clone(&self.shared.notifier),
        }
    }

    /// Unfinished tasks
    pub fn task_count(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    pub fn timer_stats(&self) -> TimerStats {
        self.shared.timers.borrow().stats()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub(crate) fn with_reactor<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> R {
        f(&mut self.shared.reactor.borrow_mut())
    }

    fn enter_loop(&self) -> SchedResult<RunningGuard> {
        if self.shared.running.replace(true) {
            return Err(SchedError::AlreadyRunning);
        }
        Ok(RunningGuard {
            shared: Rc::clone(&self.shared),
            _tls: tls::enter(self.clone()),
        })
    }

    /// Steps 1-3 of an iteration
    fn tick(&self) {
        let shared = &self.shared;
        if shared.remote_stop.swap(false, Ordering::AcqRel) {
            shared.stopping.set(true);
        }

        let expired = shared.timers.borrow_mut().pop_expired(Instant::now());
        for cb in expired {
            run_callback(cb, "timer");
        }

        let soon: Vec<Callback> = shared.soon.borrow_mut().drain(..).collect();
        for cb in soon {
            run_callback(cb, "call_soon");
        }

        for id in shared.ready.snapshot(shared.config.tick_budget) {
            self.poll_task(id);
        }
    }

    /// Step 4: wait for I/O
    fn park(&self) -> SchedResult<()> {
        let timeout = self.io_timeout();
        self.shared.reactor.borrow_mut().wait(timeout)?;
        Ok(())
    }

    fn io_timeout(&self) -> Option<Duration> {
        let shared = &self.shared;
        if !shared.ready.is_empty()
            || !shared.soon.borrow().is_empty()
            || shared.stopping.get()
            || shared.remote_stop.load(Ordering::Acquire)
        {
            return Some(Duration::ZERO);
        }
        let next = shared.timers.borrow_mut().next_deadline();
        next.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn is_stalled(&self) -> bool {
        let shared = &self.shared;
        shared.ready.is_empty()
            && shared.soon.borrow().is_empty()
            && shared.timers.borrow().is_empty()
            && shared.reactor.borrow().waiting() == 0
    }

    fn poll_task(&self, id: TaskId) {
        let shared = &self.shared;
        let (mut future, waker, token, first) = {
            let mut tasks = shared.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            let Some(future) = slot.future.take() else {
                return;
            };
            let first = !slot.started;
            slot.started = true;
            (future, Arc::clone(&slot.waker), slot.token.clone(), first)
        };
        waker.clear_queued();

        if first && token.take_request() {
            tracing::trace!(task = %id, "task cancelled before first poll");
            drop(future);
            self.finish(id, Some(SchedError::Cancelled));
            return;
        }

        let task_waker = Waker::from(waker);
        let mut cx = Context::from_waker(&task_waker);
        let started = Instant::now();
        let outcome = {
            let _ctx = coop_core::tls::enter(TaskContext { id, token });
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        let elapsed = started.elapsed();
        if shared.config.debug && elapsed >= shared.config.slow_task_threshold {
            tracing::warn!(task = %id, elapsed_ms = elapsed.as_millis() as u64, "slow task poll");
        }

        match outcome {
            Ok(Poll::Pending) => {
                let mut tasks = shared.tasks.borrow_mut();
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.future = Some(future);
                }
            }
            Ok(Poll::Ready(())) => {
                drop(future);
                self.finish(id, None);
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(task = %id, panic = %msg, "task panicked");
                drop(future);
                self.finish(id, Some(SchedError::Panicked(msg)));
            }
        }
    }

    fn finish(&self, id: TaskId, err: Option<SchedError>) {
        let slot = self.shared.tasks.borrow_mut().remove(&id);
        if let (Some(slot), Some(err)) = (slot, err) {
            (slot.abort)(err);
        }
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        let tasks = std::mem::take(&mut *shared.tasks.borrow_mut());
        if !tasks.is_empty() {
            tracing::debug!(tasks = tasks.len(), "dropping unfinished tasks");
        }
        drop(tasks);
        let soon = std::mem::take(&mut *shared.soon.borrow_mut());
        drop(soon);
        let timers = shared.timers.borrow_mut().clear();
        drop(timers);
    }
}

fn run_callback(cb: Callback, kind: &'static str) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
        let msg = panic_message(payload.as_ref());
        tracing::error!(callback = kind, panic = %msg, "callback panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stops a scheduler's `run_forever` from any thread
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.notifier.notify() {
            tracing::error!(error = %e, "stop notification failed");
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("requested", &self.flag.load(Ordering::Relaxed))
            .finish()
    }
}

/// Awaitable handle to a spawned task
///
/// Resolves to the task's output, `Err(Cancelled)` if it was cancelled
/// before finishing, or `Err(Panicked)` if it panicked. Dropping the handle
/// detaches the task.
pub struct JoinHandle<T> {
    id: TaskId,
    result: Deferred<T>,
    token: CancellationToken,
    waker: Arc<TaskWaker>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation
    ///
    /// Delivered as `Err(Cancelled)` at the task's next suspension point; a
    /// task that has not started yet never runs. Returns false if the task
    /// already finished.
    pub fn cancel(&self) -> bool {
        if self.result.done() {
            return false;
        }
        self.token.cancel();
        self.waker.wake_by_ref();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.result.done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.result.cancelled()
    }

    /// Take the outcome if the task finished
    pub fn try_take(&self) -> Option<SchedResult<T>> {
        self.result.try_take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = SchedResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.result.try_take() {
            return Poll::Ready(outcome);
        }
        // Cancelling the awaiter cancels the awaited task too
        if coop_core::tls::take_cancel_request() {
            self.cancel();
            return Poll::Ready(Err(SchedError::Cancelled));
        }
        Pin::new(&mut self.result).poll(cx)
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.result.done())
            .finish()
    }
}

/// Spawn onto the scheduler running on this thread
pub fn spawn<F>(future: F) -> SchedResult<JoinHandle<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Ok(tls::current()?.spawn(future))
}

/// Yield once to let other ready tasks run
pub async fn yield_now() -> SchedResult<()> {
    let mut yielded = false;
    std::future::poll_fn(move |cx| {
        if coop_core::tls::take_cancel_request() {
            return Poll::Ready(Err(SchedError::Cancelled));
        }
        if yielded {
            return Poll::Ready(Ok(()));
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}
