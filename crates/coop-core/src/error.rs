//! Error types for the coop scheduler and its primitives

use thiserror::Error;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors raised by the scheduler, deferred results and sync primitives.
///
/// Contract violations (`InvalidState`, `IllegalState`, `InvalidValue`)
/// indicate caller bugs and are never retried or corrected. `Cancelled` is a
/// control-flow signal delivered at a suspension point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// The current task was cancelled at a suspension point
    #[error("operation cancelled")]
    Cancelled,

    /// A `timeout` elapsed before the wrapped operation finished
    #[error("operation timed out")]
    Timeout,

    /// A deferred result was resolved twice, or read after being taken
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A primitive was used without holding what it requires
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Construction or release with an out-of-range value
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Operation needs a running task on this thread
    #[error("no task is running on this thread")]
    NoCurrentTask,

    /// Operation needs a running scheduler on this thread
    #[error("scheduler is not running")]
    NotRunning,

    /// `run_until`/`run_forever` called while the loop is already running
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The awaited future can never complete: nothing is ready, no timers,
    /// no I/O registrations
    #[error("scheduler stalled: awaited future can never complete")]
    Stalled,

    /// The task body panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Error stored explicitly through `Deferred::set_error`
    #[error("{0}")]
    Failed(String),

    /// OS-level failure in the reactor (errno)
    #[error("platform error: {0}")]
    PlatformError(i32),
}

impl SchedError {
    /// True for the cancellation control-flow signal
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedError::Cancelled)
    }
}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => SchedError::PlatformError(errno),
            None => SchedError::Failed(e.to_string()),
        }
    }
}
