//! # coop-core
//!
//! Core types for the coop cooperative scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code and no
//! event loop. The loop itself lives in `coop-runtime`; everything here only
//! needs a `Waker` and the thread-local current-task context that the runtime
//! installs while it polls a task.
//!
//! ## Modules
//!
//! - `id` - Task identifier type
//! - `error` - Scheduler error taxonomy
//! - `cancel` - One-shot cancellation requests for tasks
//! - `tls` - Thread-local current-task context
//! - `deferred` - Single-assignment completion cell
//! - `sync` - Lock, Event, Condition, Semaphore, BoundedSemaphore
//! - `env` - Environment variable utilities

pub mod id;
pub mod error;
pub mod cancel;
pub mod tls;
pub mod deferred;
pub mod sync;
pub mod env;

// Re-exports for convenience
pub use id::TaskId;
pub use error::{SchedError, SchedResult};
pub use cancel::CancellationToken;
pub use deferred::Deferred;
pub use sync::{
    BoundedSemaphore, Condition, Event, Lock, LockGuard, Semaphore, SemaphorePermit,
};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_duration_secs, env_get_opt, env_get_str};
