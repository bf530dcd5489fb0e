//! Cooperative synchronization primitives
//!
//! All primitives are single-threaded (`!Sync`) and are shared between tasks
//! through `Rc`. Waiters are served in FIFO order and every waiter removes
//! itself from its queue however its wait ends.

mod waiters;
pub mod lock;
pub mod event;
pub mod condition;
pub mod semaphore;

pub use lock::{Lock, LockGuard};
pub use event::Event;
pub use condition::Condition;
pub use semaphore::{BoundedSemaphore, Semaphore, SemaphorePermit};
