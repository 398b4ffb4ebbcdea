//! # evthread-core
//!
//! Core types for the evthread runtime.
//!
//! This crate has no knowledge of threads being spawned, timers or
//! descriptors. It holds the leaf building blocks the runtime is made of.
//!
//! ## Modules
//!
//! - `clock` - Monotonic microsecond clock
//! - `fifo` - Blocking multi-producer FIFO queue (per-thread event queue)
//! - `lru` - Idle cache handing out the most recently returned entry first
//! - `id` - Thread/timer/handle identifier types
//! - `state` - Thread lifecycle state
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod clock;
pub mod fifo;
pub mod lru;
pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use clock::{now_us, Micros};
pub use fifo::FifoQueue;
pub use lru::IdleLru;
pub use id::{ThreadId, TimerId, HandleToken};
pub use state::ThreadState;
pub use error::{RtError, RtResult, SpawnError};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str, env_get_us, env_is_set};

/// Limits shared by the runtime crates
pub mod constants {
    /// Bulk thread creation refuses counts at or above this
    pub const MAX_BULK_THREADS: usize = 1000;

    /// Longest thread name the OS accepts (Linux: 15 bytes + NUL)
    pub const MAX_THREAD_NAME: usize = 15;
}
