//! Environment variable helpers
//!
//! All runtime tunables are read through these functions, so every
//! `EVT_*` knob parses the same way: unset or unparsable values fall back
//! to the compiled-in default.
//!
//! ```ignore
//! use evthread_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let workers: usize = env_get("EVT_IO_WORKERS_MAX", 100);
//! let poll = env_get_ms("EVT_POLL_INTERVAL_MS", 100);
//! let flush = env_get_bool("EVT_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true.
///
/// Any other value is false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_flag(&val),
        Err(_) => default,
    }
}

/// Raw string value, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Duration given in milliseconds
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Duration given in microseconds
#[inline]
pub fn env_get_us(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}

/// Whether `key` is present at all
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

pub(crate) fn parse_flag(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
