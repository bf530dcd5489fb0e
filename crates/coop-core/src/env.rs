//! Environment variable helpers used by the config builders
//!
//! ```ignore
//! use coop_core::env::{env_get, env_get_bool, env_get_duration_secs};
//!
//! let port: u16 = env_get("COOP_PORT", 8000);
//! let debug = env_get_bool("COOP_DEBUG", false);
//! let timeout = env_get_duration_secs("COOP_REQUEST_TIMEOUT_SECS", Duration::from_secs(60));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as a boolean
///
/// "1", "true", "yes", "on" (any case) are true; "0", "false", "no", "off"
/// are false. Anything else, or unset, gives `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `Some(T)` if `key` is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// String value of `key`, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Integer milliseconds in `key` as a Duration
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map_or(default, Duration::from_millis)
}

/// Integer seconds in `key` as a Duration
#[inline]
pub fn env_get_duration_secs(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key).map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; tests run on parallel threads.

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__COOP_TEST_UNSET_1__", 42);
        assert_eq!(val, 42);
        let val: Option<u16> = env_get_opt("__COOP_TEST_UNSET_1__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__COOP_TEST_UNSET_1__", "hello"), "hello");
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__COOP_TEST_NUM__", " 123 ");
        let val: usize = env_get("__COOP_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__COOP_TEST_NUM__", "not_a_number");
        let val: usize = env_get("__COOP_TEST_NUM__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__COOP_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("no", false), ("0", false)] {
            std::env::set_var("__COOP_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__COOP_TEST_BOOL__", !expected), expected, "{}", raw);
        }

        std::env::set_var("__COOP_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__COOP_TEST_BOOL__", true));
        assert!(!env_get_bool("__COOP_TEST_BOOL__", false));
        std::env::remove_var("__COOP_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_durations() {
        std::env::set_var("__COOP_TEST_MS__", "250");
        assert_eq!(
            env_get_duration_ms("__COOP_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__COOP_TEST_MS__");

        assert_eq!(
            env_get_duration_secs("__COOP_TEST_UNSET_2__", Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }
}
