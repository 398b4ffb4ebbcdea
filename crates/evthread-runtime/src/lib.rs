//! # evthread-runtime
//!
//! Event threads and the services built on them.
//!
//! This crate provides:
//! - Event threads with a private FIFO and a dispatch loop (`thread`)
//! - Cross-thread scheduling of closures (`event`)
//! - The timer engine and its "timers" thread (`timer`)
//! - The epoll I/O dispatcher and its worker pool (`io`)
//! - Type-keyed alert broadcast (`alert`)
//! - Runtime configuration (`config`)

pub mod config;
pub mod tls;
pub mod thread;
pub mod event;
pub mod alert;
pub mod timer;
pub mod io;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use thread::{exit, EvThread, ThreadOptions};
pub use event::{schedule, Event};
pub use tls::{has_current, try_current};
pub use alert::{Alert, AlertChannel, AlertKind, AlertLevel, AlertType, ListenerId, Subscription};
pub use timer::{Timer, TimerCallback, TimerConfig, TimerEngine, TimerKind, TimerState, TimerStats};
pub use io::{HandleState, HandlerMode, Interest, IoConfig, IoDispatcher, IoEvent, IoHandle, IoHandler, IoStats};
