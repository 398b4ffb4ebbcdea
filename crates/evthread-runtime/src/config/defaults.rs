//! Library defaults for every runtime tunable
//!
//! Each constant can be overridden at runtime through the matching
//! `EVT_*` environment variable (see `RuntimeConfig::from_env`).

/// Dispatch loop poll interval (`EVT_POLL_INTERVAL_MS`)
pub const POLL_INTERVAL_MS: u64 = 100;

/// Timer thread sleep when no timer is armed (`EVT_TIMER_IDLE_SLEEP_MS`)
pub const TIMER_IDLE_SLEEP_MS: u64 = 3_600_000;

/// Outstanding firings of one timer that raise a stall alert
/// (`EVT_TIMER_STALL_THRESHOLD`)
pub const TIMER_STALL_THRESHOLD: u32 = 10;

/// Outstanding firings of one timer treated as a fatal protocol violation
/// (`EVT_TIMER_CALLED_LIMIT`)
pub const TIMER_CALLED_LIMIT: u32 = 10_000;

/// Maximum number of I/O worker threads (`EVT_IO_WORKERS_MAX`)
pub const IO_WORKERS_MAX: usize = 100;

/// Sleep between worker acquisition attempts at the cap (`EVT_IO_RETRY_WAIT_US`)
pub const IO_RETRY_WAIT_US: u64 = 5_000;

/// Busy time after which an idle descriptor leaves its sticky worker
/// (`EVT_IO_MIGRATE_WAIT_US`)
pub const IO_MIGRATE_WAIT_US: u64 = 10_000;

/// Capacity hint passed to `epoll_create` (`EVT_IO_EPOLL_SIZE`)
pub const IO_EPOLL_SIZE: usize = 100;

/// Readiness events fetched per wait (`EVT_IO_MAX_EVENTS`)
pub const IO_MAX_EVENTS: usize = 100;
