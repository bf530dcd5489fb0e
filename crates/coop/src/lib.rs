//! # coop - cooperative tasks on one thread
//!
//! Async tasks, timers and sockets driven by a single-threaded scheduler,
//! asyncio-style synchronization primitives, and an HTTP/1.x server built
//! on both.
//!
//! ## Quick Start
//!
//! ```ignore
//! use coop::{block_on, spawn, sleep, Lock};
//!
//! let total = block_on(async {
//!     let lock = Rc::new(Lock::new());
//!     let worker = spawn({
//!         let lock = Rc::clone(&lock);
//!         async move {
//!             let _guard = lock.lock().await?;
//!             sleep(Duration::from_millis(10)).await
//!         }
//!     })?;
//!     worker.await?
//! })?;
//! ```
//!
//! ## Crates
//!
//! ```text
//!   coop-http     protocol state machine, parser, server loop
//!       │
//!   coop-runtime  scheduler, timers, reactor, TcpListener/TcpStream
//!       │
//!   coop-core     Deferred, CancellationToken, Lock/Event/Condition/Semaphore
//! ```

use std::future::Future;

// Re-export core types
pub use coop_core::{
    BoundedSemaphore, CancellationToken, Condition, Deferred, Event, Lock, LockGuard, SchedError,
    SchedResult, Semaphore, SemaphorePermit, TaskId,
};

// Re-export env utilities
pub use coop_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use coop_runtime::{
    sleep, sleep_until, spawn, timeout, yield_now, Handle, JoinHandle, RuntimeConfig, Scheduler, StopHandle,
};

pub use coop_http as http;

/// Run `future` to completion on a fresh scheduler configured from the
/// environment
pub fn block_on<F>(future: F) -> SchedResult<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Scheduler::new()?.run_until(future)
}
