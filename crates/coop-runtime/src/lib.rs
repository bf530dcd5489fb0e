//! # coop-runtime
//!
//! Single-threaded cooperative scheduler for `coop-core` tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── Scheduler (one thread) ─────────────────────────┐
//! │                                                                           │
//! │  TimerHeap ──expired──▶ callbacks        call_soon queue ──▶ callbacks    │
//! │                                                                           │
//! │  ReadyQueue (SegQueue<TaskId>) ──snapshot──▶ poll each task once          │
//! │        ▲                                       │                          │
//! │        │ TaskWaker::wake                       ▼                          │
//! │        │                              task awaits Deferred / Sleep /      │
//! │        │                              socket readiness                    │
//! │        │                                       │                          │
//! │  Reactor (epoll | poll) ◀──register────────────┘                          │
//! │        ▲                                                                  │
//! └────────┼──────────────────────────────────────────────────────────────────┘
//!          │ Notifier (eventfd | pipe)
//!   other threads: Waker::wake, StopHandle::stop
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use coop_runtime::{Scheduler, sleep};
//!
//! let sched = Scheduler::new()?;
//! let out = sched.run_until(async {
//!     sleep(Duration::from_millis(10)).await?;
//!     Ok::<_, SchedError>(42)
//! })?;
//! ```

pub mod config;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod time;
pub mod timer;
pub mod tls;

mod ready_queue;
mod waker;

pub use config::{ConfigError, RuntimeConfig};
pub use net::{BindOptions, TcpListener, TcpStream};
pub use scheduler::{spawn, yield_now, Handle, JoinHandle, Scheduler, StopHandle};
pub use time::{sleep, sleep_until, timeout, Sleep};
pub use timer::{TimerHandle, TimerStats};
pub use tls::{current, try_current};

// Re-export core types for convenience
pub use coop_core::{SchedError, SchedResult, TaskId};
