//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters (programmatic)
//! 2. Environment variables (`EVT_*`)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use evthread_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .io_workers_max(16)
//!     .poll_interval(Duration::from_millis(20));
//! config.validate()?;
//! ```

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;

use evthread_core::env::{env_get, env_get_ms, env_get_us};
use evthread_core::RtError;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bounded wait of each dispatch loop iteration
    pub poll_interval: Duration,
    /// Timer thread sleep when nothing is armed
    pub timer_idle_sleep: Duration,
    /// Outstanding firings that raise a THREAD_STALL alert (and every multiple)
    pub timer_stall_threshold: u32,
    /// Outstanding firings that abort the process
    pub timer_called_limit: u32,
    /// I/O worker pool cap
    pub io_workers_max: usize,
    /// Sleep between acquisition attempts while the pool is exhausted
    pub io_retry_wait: Duration,
    /// Busy time of a sticky worker before an idle descriptor migrates
    pub io_migrate_wait: Duration,
    /// epoll capacity hint
    pub io_epoll_size: usize,
    /// Events fetched per epoll wait
    pub io_max_events: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Library defaults with `EVT_*` environment overrides.
    ///
    /// - `EVT_POLL_INTERVAL_MS`
    /// - `EVT_TIMER_IDLE_SLEEP_MS`
    /// - `EVT_TIMER_STALL_THRESHOLD`
    /// - `EVT_TIMER_CALLED_LIMIT`
    /// - `EVT_IO_WORKERS_MAX`
    /// - `EVT_IO_RETRY_WAIT_US`
    /// - `EVT_IO_MIGRATE_WAIT_US`
    /// - `EVT_IO_EPOLL_SIZE`
    /// - `EVT_IO_MAX_EVENTS`
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_get_ms("EVT_POLL_INTERVAL_MS", defaults::POLL_INTERVAL_MS),
            timer_idle_sleep: env_get_ms("EVT_TIMER_IDLE_SLEEP_MS", defaults::TIMER_IDLE_SLEEP_MS),
            timer_stall_threshold: env_get(
                "EVT_TIMER_STALL_THRESHOLD",
                defaults::TIMER_STALL_THRESHOLD,
            ),
            timer_called_limit: env_get("EVT_TIMER_CALLED_LIMIT", defaults::TIMER_CALLED_LIMIT),
            io_workers_max: env_get("EVT_IO_WORKERS_MAX", defaults::IO_WORKERS_MAX),
            io_retry_wait: env_get_us("EVT_IO_RETRY_WAIT_US", defaults::IO_RETRY_WAIT_US),
            io_migrate_wait: env_get_us("EVT_IO_MIGRATE_WAIT_US", defaults::IO_MIGRATE_WAIT_US),
            io_epoll_size: env_get("EVT_IO_EPOLL_SIZE", defaults::IO_EPOLL_SIZE),
            io_max_events: env_get("EVT_IO_MAX_EVENTS", defaults::IO_MAX_EVENTS),
        }
    }

    /// Library defaults only (no environment lookup).
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            timer_idle_sleep: Duration::from_millis(defaults::TIMER_IDLE_SLEEP_MS),
            timer_stall_threshold: defaults::TIMER_STALL_THRESHOLD,
            timer_called_limit: defaults::TIMER_CALLED_LIMIT,
            io_workers_max: defaults::IO_WORKERS_MAX,
            io_retry_wait: Duration::from_micros(defaults::IO_RETRY_WAIT_US),
            io_migrate_wait: Duration::from_micros(defaults::IO_MIGRATE_WAIT_US),
            io_epoll_size: defaults::IO_EPOLL_SIZE,
            io_max_events: defaults::IO_MAX_EVENTS,
        }
    }

    // Builder methods

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn timer_idle_sleep(mut self, d: Duration) -> Self {
        self.timer_idle_sleep = d;
        self
    }

    pub fn timer_stall_threshold(mut self, n: u32) -> Self {
        self.timer_stall_threshold = n;
        self
    }

    pub fn timer_called_limit(mut self, n: u32) -> Self {
        self.timer_called_limit = n;
        self
    }

    pub fn io_workers_max(mut self, n: usize) -> Self {
        self.io_workers_max = n;
        self
    }

    pub fn io_retry_wait(mut self, d: Duration) -> Self {
        self.io_retry_wait = d;
        self
    }

    pub fn io_migrate_wait(mut self, d: Duration) -> Self {
        self.io_migrate_wait = d;
        self
    }

    pub fn io_epoll_size(mut self, n: usize) -> Self {
        self.io_epoll_size = n;
        self
    }

    pub fn io_max_events(mut self, n: usize) -> Self {
        self.io_max_events = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("poll_interval must be > 0"));
        }
        if self.timer_idle_sleep.is_zero() {
            return Err(ConfigError::InvalidValue("timer_idle_sleep must be > 0"));
        }
        if self.timer_stall_threshold == 0 {
            return Err(ConfigError::InvalidValue("timer_stall_threshold must be > 0"));
        }
        if self.timer_called_limit <= self.timer_stall_threshold {
            return Err(ConfigError::InvalidValue(
                "timer_called_limit must be > timer_stall_threshold",
            ));
        }
        if self.io_workers_max == 0 {
            return Err(ConfigError::InvalidValue("io_workers_max must be > 0"));
        }
        if self.io_workers_max >= evthread_core::constants::MAX_BULK_THREADS {
            return Err(ConfigError::InvalidValue("io_workers_max must be < 1000"));
        }
        if self.io_epoll_size == 0 || self.io_epoll_size > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("io_epoll_size out of range"));
        }
        if self.io_max_events == 0 || self.io_max_events > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("io_max_events out of range"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        evthread_core::kprintln!("evthread configuration:");
        evthread_core::kprintln!("  poll_interval:          {:?}", self.poll_interval);
        evthread_core::kprintln!("  timer_idle_sleep:       {:?}", self.timer_idle_sleep);
        evthread_core::kprintln!("  timer_stall_threshold:  {}", self.timer_stall_threshold);
        evthread_core::kprintln!("  timer_called_limit:     {}", self.timer_called_limit);
        evthread_core::kprintln!("  io_workers_max:         {}", self.io_workers_max);
        evthread_core::kprintln!("  io_retry_wait:          {:?}", self.io_retry_wait);
        evthread_core::kprintln!("  io_migrate_wait:        {:?}", self.io_migrate_wait);
        evthread_core::kprintln!("  io_epoll_size:          {}", self.io_epoll_size);
        evthread_core::kprintln!("  io_max_events:          {}", self.io_max_events);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Fails if a configuration was already installed or read.
pub fn install(config: RuntimeConfig) -> Result<(), RuntimeConfig> {
    GLOBAL.set(config)
}

/// Process-wide configuration (environment defaults unless installed first)
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for RtError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => RtError::Config(msg.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.timer_stall_threshold, 10);
        assert_eq!(config.io_workers_max, 100);
        assert_eq!(config.io_retry_wait, Duration::from_millis(5));
        assert_eq!(config.io_migrate_wait, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .io_workers_max(4)
            .poll_interval(Duration::from_millis(5))
            .timer_stall_threshold(3);

        assert_eq!(config.io_workers_max, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.timer_stall_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().io_workers_max(0).validate().is_err());
        assert!(RuntimeConfig::new().io_workers_max(1000).validate().is_err());
        assert!(RuntimeConfig::new()
            .poll_interval(Duration::ZERO)
            .validate()
            .is_err());

        let err = RuntimeConfig::new()
            .timer_stall_threshold(50)
            .timer_called_limit(50)
            .validate()
            .unwrap_err();
        assert!(matches!(RtError::from(err), RtError::Config(_)));
    }
}
