//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! ```rust,ignore
//! use coop_runtime::config::RuntimeConfig;
//!
//! // Defaults with env overrides
//! let config = RuntimeConfig::from_env();
//!
//! // Or customize programmatically
//! let config = RuntimeConfig::new()
//!     .debug(true)
//!     .slow_task_threshold(Duration::from_millis(50));
//! ```

use std::time::Duration;

use coop_core::env::{env_get, env_get_bool, env_get_duration_ms};
use thiserror::Error;

pub mod defaults {
    /// Max readiness events fetched per reactor wait
    pub const IO_EVENTS: usize = 256;
    /// Max tasks polled per loop iteration
    pub const TICK_BUDGET: usize = 1024;
    pub const DEBUG: bool = false;
    /// Polls slower than this are reported in debug mode
    pub const SLOW_TASK_MS: u64 = 100;
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Max readiness events fetched per reactor wait
    pub io_events: usize,
    /// Max tasks polled per loop iteration; the rest run next iteration
    pub tick_budget: usize,
    /// Debug mode: report slow task polls
    pub debug: bool,
    /// Threshold for the slow-task warning
    pub slow_task_threshold: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COOP_IO_EVENTS` - Events per reactor wait
    /// - `COOP_TICK_BUDGET` - Tasks polled per iteration
    /// - `COOP_DEBUG` - Debug mode (0/1)
    /// - `COOP_SLOW_TASK_MS` - Slow-task threshold in milliseconds
    pub fn from_env() -> Self {
        Self {
            io_events: env_get("COOP_IO_EVENTS", defaults::IO_EVENTS),
            tick_budget: env_get("COOP_TICK_BUDGET", defaults::TICK_BUDGET),
            debug: env_get_bool("COOP_DEBUG", defaults::DEBUG),
            slow_task_threshold: env_get_duration_ms(
                "COOP_SLOW_TASK_MS",
                Duration::from_millis(defaults::SLOW_TASK_MS),
            ),
        }
    }

    /// Library defaults, no env override
    pub fn new() -> Self {
        Self {
            io_events: defaults::IO_EVENTS,
            tick_budget: defaults::TICK_BUDGET,
            debug: defaults::DEBUG,
            slow_task_threshold: Duration::from_millis(defaults::SLOW_TASK_MS),
        }
    }

    pub fn io_events(mut self, n: usize) -> Self {
        self.io_events = n;
        self
    }

    pub fn tick_budget(mut self, n: usize) -> Self {
        self.tick_budget = n;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn slow_task_threshold(mut self, d: Duration) -> Self {
        self.slow_task_threshold = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_events == 0 {
            return Err(ConfigError::InvalidValue("io_events must be > 0"));
        }
        if self.io_events > 65536 {
            return Err(ConfigError::InvalidValue("io_events must be <= 65536"));
        }
        if self.tick_budget == 0 {
            return Err(ConfigError::InvalidValue("tick_budget must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}
