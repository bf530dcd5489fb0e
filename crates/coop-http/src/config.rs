//! Server configuration
//!
//! ```rust,ignore
//! use coop_http::config::ServerConfig;
//!
//! // Defaults with env overrides
//! let config = ServerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = ServerConfig::new()
//!     .port(8080)
//!     .request_timeout(Duration::from_secs(5));
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use coop_core::env::{env_get, env_get_bool, env_get_duration_ms, env_get_duration_secs, env_get_str};
use thiserror::Error;

use crate::parser::ParserLimits;

pub mod defaults {
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 8000;
    pub const REQUEST_TIMEOUT_SECS: u64 = 60;
    /// 100 MiB
    pub const REQUEST_MAX_SIZE: usize = 100 * 1024 * 1024;
    pub const REUSE_PORT: bool = false;
    pub const BACKLOG: i32 = 1024;
    pub const DEBUG: bool = false;
    /// Interval between checks while draining, and for the signal watcher
    pub const DRAIN_POLL_MS: u64 = 100;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Idle window per connection
    pub request_timeout: Duration,
    /// Upper bound on the bytes of one request
    pub request_max_size: usize,
    pub reuse_port: bool,
    pub backlog: i32,
    /// Show internal error details in 500 responses
    pub debug: bool,
    pub drain_poll: Duration,
    /// Stop on SIGINT/SIGTERM and ignore SIGPIPE
    pub handle_signals: bool,
    pub limits: ParserLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COOP_HOST` - Listen address
    /// - `COOP_PORT` - Listen port
    /// - `COOP_REQUEST_TIMEOUT_SECS` - Idle window in seconds
    /// - `COOP_REQUEST_MAX_SIZE` - Max request size in bytes
    /// - `COOP_REUSE_PORT` - Set SO_REUSEPORT (0/1)
    /// - `COOP_BACKLOG` - listen(2) backlog
    /// - `COOP_DEBUG` - Debug mode (0/1)
    /// - `COOP_DRAIN_POLL_MS` - Drain poll interval in milliseconds
    pub fn from_env() -> Self {
        Self {
            host: env_get_str("COOP_HOST", defaults::HOST),
            port: env_get("COOP_PORT", defaults::PORT),
            request_timeout: env_get_duration_secs(
                "COOP_REQUEST_TIMEOUT_SECS",
                Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS),
            ),
            request_max_size: env_get("COOP_REQUEST_MAX_SIZE", defaults::REQUEST_MAX_SIZE),
            reuse_port: env_get_bool("COOP_REUSE_PORT", defaults::REUSE_PORT),
            backlog: env_get("COOP_BACKLOG", defaults::BACKLOG),
            debug: env_get_bool("COOP_DEBUG", defaults::DEBUG),
            drain_poll: env_get_duration_ms(
                "COOP_DRAIN_POLL_MS",
                Duration::from_millis(defaults::DRAIN_POLL_MS),
            ),
            handle_signals: true,
            limits: ParserLimits::default(),
        }
    }

    /// Library defaults, no env override
    pub fn new() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            request_timeout: Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS),
            request_max_size: defaults::REQUEST_MAX_SIZE,
            reuse_port: defaults::REUSE_PORT,
            backlog: defaults::BACKLOG,
            debug: defaults::DEBUG,
            drain_poll: Duration::from_millis(defaults::DRAIN_POLL_MS),
            handle_signals: true,
            limits: ParserLimits::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    pub fn request_max_size(mut self, bytes: usize) -> Self {
        self.request_max_size = bytes;
        self
    }

    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.reuse_port = enable;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn drain_poll(mut self, d: Duration) -> Self {
        self.drain_poll = d;
        self
    }

    pub fn handle_signals(mut self, enable: bool) -> Self {
        self.handle_signals = enable;
        self
    }

    pub fn limits(mut self, limits: ParserLimits) -> Self {
        self.limits = limits;
        self
    }

    /// First address `host:port` resolves to
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::BadAddress(format!("{}:{}", self.host, self.port)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("request_timeout must be > 0"));
        }
        if self.request_max_size == 0 {
            return Err(ConfigError::InvalidValue("request_max_size must be > 0"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.drain_poll.is_zero() {
            return Err(ConfigError::InvalidValue("drain_poll must be > 0"));
        }
        if self.limits.max_line_len == 0 || self.limits.max_header_count == 0 {
            return Err(ConfigError::InvalidValue("parser limits must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    #[error("cannot resolve listen address {0}")]
    BadAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ServerConfig::new();
        assert_eq!(config.port, defaults::PORT);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.request_max_size, 100 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .host("0.0.0.0")
            .port(9090)
            .request_timeout(Duration::from_secs(5))
            .request_max_size(1024)
            .reuse_port(true)
            .debug(true);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert!(config.reuse_port);
        assert!(config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::new().request_timeout(Duration::ZERO).validate().is_err());
        assert!(ServerConfig::new().request_max_size(0).validate().is_err());
        assert!(ServerConfig::new().backlog(0).validate().is_err());
        assert!(ServerConfig::new().host("").validate().is_err());
    }

    #[test]
    fn test_socket_addr() {
        let addr = ServerConfig::new().host("127.0.0.1").port(0).socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 0);

        let err = ServerConfig::new().host("not a host").socket_addr().unwrap_err();
        assert!(matches!(err, ConfigError::BadAddress(_)));
    }
}
