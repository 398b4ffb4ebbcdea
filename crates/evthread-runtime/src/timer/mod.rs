//! Timer engine
//!
//! A single deadline-ordered set of armed timers served by one dedicated
//! thread ("timers"). When a timer is due the engine does not run its
//! callback: it posts a dispatch event onto the timer's target thread, and
//! the callback runs there, serialized with everything else that thread
//! does.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Timer::start / stop / destroy   (any thread)               │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ engine lock
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  EngineState: BinaryHeap<(deadline, seq, id)> + slot map    │
//! │  next_wake_us ── Condvar ──► "timers" thread                │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ post(firing)   (lock released)
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  target EvThread: callback(&Timer), then completion         │
//! │  (re-arm RECURRING, free ATOMIC / REMOVED)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Destroying a timer whose firing is still queued or running only marks
//! it REMOVED; the last completion frees it. A callback may therefore
//! destroy, stop or restart its own timer.

pub mod entry;
mod engine;
mod worker;

use std::time::Duration;

use crate::config::RuntimeConfig;

pub use engine::{Timer, TimerEngine};
pub use entry::{TimerCallback, TimerKind, TimerState};

/// Timer engine settings
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Sleep when no timer is armed
    pub idle_sleep: Duration,
    /// Outstanding firings of one timer that raise THREAD_STALL (and every multiple)
    pub stall_threshold: u32,
    /// Outstanding firings that abort
    pub called_limit: u32,
    /// Poll interval of the timer thread's handle
    pub poll_interval: Duration,
}

impl From<&RuntimeConfig> for TimerConfig {
    fn from(c: &RuntimeConfig) -> Self {
        Self {
            idle_sleep: c.timer_idle_sleep,
            stall_threshold: c.timer_stall_threshold.max(1),
            called_limit: c.timer_called_limit,
            poll_interval: c.poll_interval,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self::from(crate::config::global())
    }
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Timers created (handles and engine-owned)
    pub created: u64,
    /// Arm operations, including recurring re-arms
    pub armed: u64,
    /// Firings posted to target threads
    pub fired: u64,
    /// Firings completed on target threads
    pub completed: u64,
    /// Timers freed
    pub freed: u64,
    /// THREAD_STALL alerts raised
    pub stalls: u64,
}
