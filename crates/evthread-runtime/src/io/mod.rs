//! I/O dispatcher
//!
//! Multiplexes many descriptors over one readiness thread and a bounded
//! pool of worker threads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  IoDispatcher::add / del        (any thread)                │
//! │  registry: fd ─► Arc<IoHandle>, token ─► Arc<IoHandle>      │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ epoll_ctl
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  "io" thread: epoll_wait ─► route(token)                    │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │ NonBlocking                  │ MayBlock
//!                ▼                              ▼
//!          handler inline            sticky worker "io:N"
//!                                    (idle LRU, capped pool)
//! ```
//!
//! A descriptor's events go to one worker at a time, so its handler never
//! runs concurrently with itself and sees events in detection order.

pub mod interest;
pub mod poller;
pub mod handle;
pub mod pool;
mod dispatcher;

pub use interest::Interest;
pub use handle::{HandleState, HandlerMode, IoEvent, IoHandle, IoHandler};
pub use pool::{IoWorker, IoWorkerPool};
pub use dispatcher::{IoConfig, IoDispatcher, IoStats};
