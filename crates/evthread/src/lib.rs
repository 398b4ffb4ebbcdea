//! # evthread - event-queue threads over OS threads
//!
//! Every thread owns a FIFO of dispatch events. Work is scheduled by
//! posting closures onto a target thread's queue; that thread runs them one
//! at a time from its dispatch loop. Two service threads build on this:
//!
//! - **Timers**: one "timers" thread keeps armed timers ordered by deadline
//!   and posts each firing onto the timer's target thread.
//! - **I/O**: one "io" thread waits on epoll and routes ready descriptors to
//!   a capped pool of worker threads, one worker per descriptor at a time.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use evthread::{TimerKind, EvThread};
//!
//! fn main() -> evthread::RtResult<()> {
//!     let rt = evthread::init()?;
//!
//!     let worker = evthread::spawn("worker", |me| me.dispatch())?;
//!     evthread::schedule(&worker, || println!("hello from worker"));
//!
//!     evthread::add_timer(TimerKind::Once, Duration::from_millis(50), &worker, |_| {
//!         println!("timer fired on {}", EvThread::current().name());
//!     })?;
//!
//!     std::thread::sleep(Duration::from_millis(100));
//!     worker.kill_join();
//!     rt.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      spawn(), schedule(), timers, io_add() / io_del()       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  "timers" │      │   "io"    │      │  "io:N"   │
//!    │  thread   │      │  thread   │      │  workers  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼  post(event)
//!    ┌─────────────────────────────────────────────────────────┐
//!    │            target EvThread: FIFO ─► dispatch()          │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

// Re-export core types
pub use evthread_core::{
    now_us,
    Micros,
    FifoQueue,
    ThreadId,
    TimerId,
    ThreadState,
    RtError,
    RtResult,
    SpawnError,
};

// Re-export kprint macros for debug logging
pub use evthread_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use evthread_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use evthread_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use evthread_runtime::{
    exit,
    schedule,
    Alert,
    AlertChannel,
    AlertKind,
    AlertLevel,
    AlertType,
    EvThread,
    HandleState,
    HandlerMode,
    Interest,
    IoDispatcher,
    IoEvent,
    IoHandle,
    IoStats,
    ListenerId,
    RuntimeConfig,
    Subscription,
    ThreadOptions,
    Timer,
    TimerEngine,
    TimerKind,
    TimerState,
    TimerStats,
};

use evthread_runtime::config;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Process-wide runtime: the hosting thread's handle, the alert channel,
/// the timer engine and the I/O dispatcher.
pub struct Runtime {
    config: RuntimeConfig,
    main: EvThread,
    alerts: Arc<AlertChannel>,
    timers: TimerEngine,
    io: IoDispatcher,
}

impl Runtime {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle of the thread that called `init`
    pub fn main_thread(&self) -> &EvThread {
        &self.main
    }

    pub fn alerts(&self) -> &Arc<AlertChannel> {
        &self.alerts
    }

    pub fn timers(&self) -> &TimerEngine {
        &self.timers
    }

    pub fn io(&self) -> &IoDispatcher {
        &self.io
    }

    /// Stop the timer engine and the I/O dispatcher and join their threads.
    ///
    /// Threads created with `spawn` are left alone.
    pub fn shutdown(&self) {
        kinfo!("evthread runtime shutting down");
        self.timers.shutdown();
        self.io.shutdown();
    }
}

/// Initialize the runtime from the environment (`EVT_*` variables)
pub fn init() -> RtResult<&'static Runtime> {
    init_with(RuntimeConfig::from_env())
}

/// Initialize the runtime with an explicit configuration.
///
/// The calling thread becomes the runtime's main thread. Fails with
/// `AlreadyInitialized` on a second call.
pub fn init_with(cfg: RuntimeConfig) -> RtResult<&'static Runtime> {
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if RUNTIME.get().is_some() {
        return Err(RtError::AlreadyInitialized);
    }
    cfg.validate()?;
    evthread_core::kprint::init();

    if config::install(cfg.clone()).is_err() {
        kwarn!("process configuration already in use; new threads keep its poll interval");
    }

    let main = EvThread::init_main("main");
    let alerts = Arc::new(AlertChannel::new());
    let timers = TimerEngine::from_config(&cfg, Arc::clone(&alerts));
    timers.start()?;
    let io = IoDispatcher::from_config(&cfg);

    if evthread_core::kprint::level_enabled(LogLevel::Debug) {
        cfg.print();
    }
    kinfo!("evthread runtime initialized on '{}'", main.name());

    let rt = Runtime {
        config: cfg,
        main,
        alerts,
        timers,
        io,
    };
    match RUNTIME.set(rt) {
        Ok(()) => RUNTIME.get().ok_or(RtError::NotInitialized),
        Err(_) => Err(RtError::AlreadyInitialized),
    }
}

/// The initialized runtime
pub fn runtime() -> RtResult<&'static Runtime> {
    RUNTIME.get().ok_or(RtError::NotInitialized)
}

pub fn is_initialized() -> bool {
    RUNTIME.get().is_some()
}

/// Spawn a named event thread running `start` with its own handle.
///
/// Most threads just call `me.dispatch()`.
pub fn spawn<F>(name: &str, start: F) -> RtResult<EvThread>
where
    F: FnOnce(&EvThread) + Send + 'static,
{
    EvThread::spawn(name, start)
}

/// Spawn `count` threads named `<prefix><i>`
pub fn spawn_many<F>(prefix: &str, count: usize, start: F) -> RtResult<Vec<EvThread>>
where
    F: Fn(&EvThread) + Send + Sync + 'static,
{
    EvThread::spawn_many(prefix, count, start)
}

/// Handle of the calling thread
pub fn current() -> EvThread {
    EvThread::current()
}

/// Create an idle timer whose callback runs on `target`
pub fn timer<F>(kind: TimerKind, target: &EvThread, callback: F) -> RtResult<Timer>
where
    F: FnMut(&Timer) + Send + 'static,
{
    runtime()?.timers.create(kind, target, callback)
}

/// Create and start an engine-owned timer
pub fn add_timer<F>(kind: TimerKind, interval: Duration, target: &EvThread, callback: F) -> RtResult<TimerId>
where
    F: FnMut(&Timer) + Send + 'static,
{
    runtime()?.timers.add(kind, interval, target, callback)
}

/// Register (or update) a descriptor with the I/O dispatcher
pub fn io_add<F>(
    fd: RawFd,
    interest: Interest,
    mode: HandlerMode,
    target: Option<&EvThread>,
    handler: F,
) -> RtResult<()>
where
    F: Fn(&IoEvent) + Send + Sync + 'static,
{
    runtime()?.io.add(fd, interest, mode, target, handler)
}

/// Unregister a descriptor. Returns false if it was not registered.
pub fn io_del(fd: RawFd) -> bool {
    RUNTIME.get().map_or(false, |rt| rt.io.del(fd))
}

/// Listen for alerts
pub fn on_alert<F>(sub: Subscription, listener: F) -> RtResult<ListenerId>
where
    F: Fn(&Alert) + Send + Sync + 'static,
{
    Ok(runtime()?.alerts.register(sub, listener))
}

/// Shut the runtime's services down (no-op before `init`)
pub fn shutdown() {
    if let Some(rt) = RUNTIME.get() {
        rt.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn rt() -> &'static Runtime {
        let cfg = RuntimeConfig::new()
            .poll_interval(Duration::from_millis(20))
            .io_workers_max(4);
        match init_with(cfg) {
            Ok(rt) => rt,
            Err(RtError::AlreadyInitialized) => runtime().unwrap(),
            Err(e) => panic!("init failed: {}", e),
        }
    }

    #[test]
    fn test_init_once() {
        let rt = rt();
        assert!(is_initialized());
        assert!(matches!(init(), Err(RtError::AlreadyInitialized)));
        assert!(rt.timers().is_running());
        assert_eq!(rt.config().io_workers_max, 4);
    }

    #[test]
    fn test_schedule_and_timer() {
        rt();
        let worker = spawn("facade-w", |me| me.dispatch()).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        assert!(schedule(&worker, move || tx2.send("scheduled").unwrap()));
        add_timer(TimerKind::Once, Duration::from_millis(20), &worker, move |_| {
            tx.send("timer").unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "scheduled");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "timer");
        assert!(worker.kill_join());
    }

    #[test]
    fn test_io_round_trip() {
        rt();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        io_add(fd, Interest::READABLE, HandlerMode::MayBlock, None, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 16];
            let n = (&b).read(&mut buf).unwrap_or(0);
            let _ = tx.send(buf[..n].to_vec());
        })
        .unwrap();

        a.write_all(b"hi").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hi");

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert!(io_del(fd));
        assert!(!io_del(fd));
    }

    #[test]
    fn test_alert_listener() {
        rt();
        let id = on_alert(Subscription::All, |_| {}).unwrap();
        assert!(runtime().unwrap().alerts().unregister(id));
    }
}
