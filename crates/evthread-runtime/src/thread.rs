//! Event threads
//!
//! An `EvThread` is an OS thread with a name, a lifecycle state and a
//! private FIFO of dispatch events. Any thread may post to it; the owner
//! runs the events one at a time, in arrival order, from its dispatch loop.
//!
//! ```text
//!   post(f) ──► FifoQueue<Event> ──► dispatch(): poll(interval) ──► f()
//!                                         │
//!               kill() ── Exiting ────────┘ loop exits, tls cleared, Exited
//! ```
//!
//! Handles are cheap to clone and stay valid after the thread exits; a
//! posted event to an exited thread is refused.

use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use evthread_core::constants::{MAX_BULK_THREADS, MAX_THREAD_NAME};
use evthread_core::{kdebug, kerror, ktrace, kwarn};
use evthread_core::{FifoQueue, RtError, RtResult, ThreadId, ThreadState};

use crate::config;
use crate::event::Event;
use crate::tls;

/// Per-spawn options
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    /// Bounded wait of each dispatch loop iteration
    pub poll_interval: Duration,
    /// Block every signal on the new thread
    pub block_signals: bool,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            poll_interval: config::global().poll_interval,
            block_signals: false,
        }
    }
}

impl ThreadOptions {
    /// Options for the runtime's own service threads
    pub fn service(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            block_signals: true,
        }
    }
}

struct ThreadInner {
    id: ThreadId,
    name: String,
    state: AtomicU8,
    queue: FifoQueue<Event>,
    poll_interval: Duration,
    join: Mutex<Option<JoinHandle<()>>>,
    events_run: AtomicU64,
}

/// Handle to an event thread
#[derive(Clone)]
pub struct EvThread {
    inner: Arc<ThreadInner>,
}

impl EvThread {
    fn new(name: &str, poll_interval: Duration, state: ThreadState) -> Self {
        Self {
            inner: Arc::new(ThreadInner {
                id: ThreadId::next(),
                name: name.to_string(),
                state: AtomicU8::new(state as u8),
                queue: FifoQueue::new(),
                poll_interval,
                join: Mutex::new(None),
                events_run: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Spawn a thread running `start` with its own handle.
    ///
    /// The event queue exists before this returns, so events may be posted
    /// immediately; they run once `start` enters `dispatch()` or `poll()`.
    pub fn spawn<F>(name: &str, start: F) -> RtResult<EvThread>
    where
        F: FnOnce(&EvThread) + Send + 'static,
    {
        Self::spawn_with(name, ThreadOptions::default(), start)
    }

    pub fn spawn_with<F>(name: &str, opts: ThreadOptions, start: F) -> RtResult<EvThread>
    where
        F: FnOnce(&EvThread) + Send + 'static,
    {
        let thread = EvThread::new(name, opts.poll_interval, ThreadState::Created);
        let child = thread.clone();
        let block_signals = opts.block_signals;

        let handle = thread::Builder::new()
            .name(os_thread_name(name))
            .spawn(move || {
                if block_signals {
                    block_all_signals();
                }
                child.run(start);
            })
            .map_err(|e| {
                kerror!("failed to spawn thread '{}': {}", name, e);
                RtError::spawn(name, &e)
            })?;

        *thread.lock_join() = Some(handle);
        kdebug!("spawned thread '{}' ({})", name, thread.id());
        Ok(thread)
    }

    /// Spawn a thread whose only job is to run its dispatch loop
    pub fn spawn_dispatcher(name: &str) -> RtResult<EvThread> {
        Self::spawn(name, |me| me.dispatch())
    }

    /// Spawn `count` threads named `<prefix><i>`.
    ///
    /// Fails only if every spawn failed; otherwise returns the threads that
    /// were created.
    pub fn spawn_many<F>(prefix: &str, count: usize, start: F) -> RtResult<Vec<EvThread>>
    where
        F: Fn(&EvThread) + Send + Sync + 'static,
    {
        if count >= MAX_BULK_THREADS {
            return Err(RtError::TooManyThreads(count));
        }

        let start = Arc::new(start);
        let mut threads = Vec::with_capacity(count);
        let mut last_err = None;

        for i in 0..count {
            let start = Arc::clone(&start);
            match Self::spawn(&format!("{}{}", prefix, i), move |me| start(me)) {
                Ok(t) => threads.push(t),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) if threads.is_empty() => Err(e),
            Some(e) => {
                kwarn!(
                    "spawn_many '{}': {} of {} threads failed ({})",
                    prefix,
                    count - threads.len(),
                    count,
                    e
                );
                Ok(threads)
            }
            None => Ok(threads),
        }
    }

    /// Install a handle for the hosting (main) thread without spawning.
    ///
    /// Returns the existing handle if the calling thread already has one.
    pub fn init_main(name: &str) -> EvThread {
        if let Some(t) = tls::try_current() {
            return t;
        }
        let thread = EvThread::new(name, config::global().poll_interval, ThreadState::Running);
        tls::set_current(thread.clone());
        kdebug!("hosting thread registered as '{}' ({})", name, thread.id());
        thread
    }

    /// Handle of the calling thread.
    ///
    /// Threads not created by the runtime are adopted on first call.
    pub fn current() -> EvThread {
        match tls::try_current() {
            Some(t) => t,
            None => Self::init_main(&adopted_name()),
        }
    }

    fn run<F>(&self, start: F)
    where
        F: FnOnce(&EvThread),
    {
        let _ = self.inner.state.compare_exchange(
            ThreadState::Created as u8,
            ThreadState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tls::set_current(self.clone());

        // Runs on normal return and on unwind
        struct Finish<'a>(&'a EvThread);
        impl Drop for Finish<'_> {
            fn drop(&mut self) {
                self.0.finish();
            }
        }
        let _finish = Finish(self);

        start(self);
    }

    /// Thread-local cleanup; idempotent.
    fn finish(&self) {
        if self.is_current() {
            tls::clear_current();
        }
        let prev = self.inner.state.swap(ThreadState::Exited as u8, Ordering::AcqRel);
        if prev == ThreadState::Exited as u8 {
            return;
        }

        fence(Ordering::SeqCst);
        let dropped = self.drop_queued();
        kdebug!(
            "thread '{}' exited ({} events run, {} dropped)",
            self.name(),
            self.events_run(),
            dropped
        );
    }

    /// Drop every queued event unrun; dropping releases what it captured
    fn drop_queued(&self) -> usize {
        let mut dropped = 0;
        while let Some(ev) = self.inner.queue.try_pop() {
            drop(ev);
            dropped += 1;
        }
        dropped
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.inner.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    /// Check if this handle belongs to the calling thread
    pub fn is_current(&self) -> bool {
        tls::try_current().map_or(false, |t| t.id() == self.id())
    }

    /// Events waiting in the queue
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Events run over the thread's lifetime
    #[inline]
    pub fn events_run(&self) -> u64 {
        self.inner.events_run.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Append `f` to this thread's queue.
    ///
    /// Returns false, dropping `f`, once the thread is exiting. An event
    /// pushed while the thread finishes is either run or dropped, never
    /// left in the queue.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state().is_live() {
            ktrace!("post to exiting thread '{}' refused", self.name());
            return false;
        }
        self.inner.queue.push(Event::new(f));

        // Pairs with the fence in finish(): either its drain sees this
        // event or we see Exited here.
        fence(Ordering::SeqCst);
        if self.state() == ThreadState::Exited {
            let dropped = self.drop_queued();
            ktrace!("post raced exit of '{}' ({} dropped)", self.name(), dropped);
            return false;
        }
        true
    }

    /// Run events until the state leaves RUNNING, then clean up.
    pub fn dispatch(&self) {
        kdebug!("thread '{}' dispatching", self.name());
        while self.is_running() {
            self.poll(Some(self.inner.poll_interval));
        }
        self.finish();
    }

    /// Run every ready event.
    ///
    /// Waits up to `timeout` for the first one (`None` blocks until one
    /// arrives), then drains the rest without waiting. Returns the number
    /// of events run.
    pub fn poll(&self, timeout: Option<Duration>) -> usize {
        let mut count = 0;
        let mut next = self.inner.queue.pop(timeout);
        while let Some(ev) = next {
            ev.call();
            count += 1;
            next = self.inner.queue.try_pop();
        }
        if count > 0 {
            self.inner.events_run.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Ask the thread to stop; its dispatch loop returns promptly.
    pub fn kill(&self) {
        let moved = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                ThreadState::from(s)
                    .is_live()
                    .then_some(ThreadState::Exiting as u8)
            })
            .is_ok();
        if moved {
            kdebug!("thread '{}' asked to exit", self.name());
            self.inner.queue.push(Event::wakeup());
        }
    }

    /// Wait for the OS thread to finish.
    ///
    /// Returns false if there is nothing to join (already joined, hosting
    /// thread, or called from the thread itself) or the thread panicked.
    pub fn join(&self) -> bool {
        if self.is_current() {
            kwarn!("thread '{}' cannot join itself", self.name());
            return false;
        }
        let handle = self.lock_join().take();
        match handle {
            Some(h) => match h.join() {
                Ok(()) => true,
                Err(_) => {
                    kerror!("thread '{}' panicked", self.name());
                    false
                }
            },
            None => false,
        }
    }

    /// `kill()` followed by `join()`
    pub fn kill_join(&self) -> bool {
        self.kill();
        self.join()
    }

    fn lock_join(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.join.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EvThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl PartialEq for EvThread {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for EvThread {}

/// Make the calling thread leave its dispatch loop
pub fn exit() {
    if let Some(t) = tls::try_current() {
        t.kill();
    }
}

fn os_thread_name(name: &str) -> String {
    let mut s: String = name.chars().filter(|&c| c != '\0').collect();
    if s.len() > MAX_THREAD_NAME {
        let mut end = MAX_THREAD_NAME;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn adopted_name() -> String {
    if let Some(name) = thread::current().name() {
        return name.to_string();
    }
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            let tid = unsafe { libc::syscall(libc::SYS_gettid) };
            format!("tid:{}", tid)
        } else {
            format!("{:?}", thread::current().id())
        }
    }
}

fn block_all_signals() {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None) {
                kwarn!("failed to block signals: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn fast() -> ThreadOptions {
        ThreadOptions {
            poll_interval: Duration::from_millis(10),
            block_signals: false,
        }
    }

    #[test]
    fn test_spawn_sees_own_handle() {
        let (tx, rx) = mpsc::channel();
        let t = EvThread::spawn("self-check", move |me| {
            let cur = EvThread::current();
            tx.send((cur.id() == me.id(), me.state(), cur.name().to_string()))
                .unwrap();
        })
        .unwrap();

        let (same, state, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(same);
        assert_eq!(state, ThreadState::Running);
        assert_eq!(name, "self-check");

        assert!(t.join());
        assert_eq!(t.state(), ThreadState::Exited);
        assert!(!t.join());
    }

    #[test]
    fn test_spawn_many() {
        assert_eq!(
            EvThread::spawn_many("x", 1000, |_| {}).unwrap_err(),
            RtError::TooManyThreads(1000)
        );

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let threads = EvThread::spawn_many("bulk", 3, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let names: Vec<_> = threads.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["bulk0", "bulk1", "bulk2"]);
        for t in &threads {
            assert!(t.join());
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(EvThread::spawn_many("none", 0, |_| {}).unwrap().is_empty());
    }

    #[test]
    fn test_poll_drains_and_counts() {
        let me = EvThread::current();
        assert_eq!(me.poll(Some(Duration::ZERO)), 0);

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            assert!(me.post(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(me.poll(Some(Duration::ZERO)), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(me.events_run(), 3);
    }

    #[test]
    fn test_poll_infinite_waits_for_event() {
        let me = EvThread::current();
        let target = me.clone();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            target.post(|| {});
        });
        let start = Instant::now();
        assert_eq!(me.poll(None), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
        poster.join().unwrap();
    }

    #[test]
    fn test_init_main_is_stable() {
        let main = EvThread::init_main("host");
        assert_eq!(main.name(), "host");
        assert_eq!(main.state(), ThreadState::Running);
        assert_eq!(EvThread::current(), main);
        assert_eq!(EvThread::init_main("other"), main);
        assert!(!main.join());
    }

    #[test]
    fn test_kill_wakes_dispatch_loop() {
        let opts = ThreadOptions {
            poll_interval: Duration::from_secs(30),
            block_signals: true,
        };
        let t = EvThread::spawn_with("sleepy", opts, |me| me.dispatch()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        assert!(t.kill_join());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(t.state(), ThreadState::Exited);
        assert!(!t.post(|| {}));
    }

    #[test]
    fn test_exit_from_event() {
        let t = EvThread::spawn_with("quitter", fast(), |me| me.dispatch()).unwrap();
        let after = Arc::new(AtomicUsize::new(0));
        t.post(exit);
        std::thread::sleep(Duration::from_millis(50));
        let a = Arc::clone(&after);
        t.post(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        assert!(t.join());
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_long_names_are_accepted() {
        let t = EvThread::spawn("a-very-long-thread-name-indeed", |_| {}).unwrap();
        assert_eq!(t.name(), "a-very-long-thread-name-indeed");
        assert!(t.join());
        assert_eq!(os_thread_name("a-very-long-thread-name-indeed").len(), 15);
    }

    #[test]
    fn test_events_posted_during_exit_are_released() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        for round in 0..50 {
            let t = EvThread::spawn_with(&format!("racer{}", round), fast(), |me| me.dispatch()).unwrap();
            let released = Arc::new(AtomicUsize::new(0));
            let posted = Arc::new(AtomicUsize::new(0));

            let posters: Vec<_> = (0..2)
                .map(|_| {
                    let t = t.clone();
                    let released = Arc::clone(&released);
                    let posted = Arc::clone(&posted);
                    std::thread::spawn(move || {
                        for _ in 0..200 {
                            let guard = Counted(Arc::clone(&released));
                            posted.fetch_add(1, Ordering::SeqCst);
                            t.post(move || drop(guard));
                        }
                    })
                })
                .collect();

            t.kill();
            for p in posters {
                p.join().unwrap();
            }
            assert!(t.join());

            // Every closure either ran or was dropped, none is stranded
            assert_eq!(released.load(Ordering::SeqCst), posted.load(Ordering::SeqCst));
            assert_eq!(t.queue_len(), 0);
        }
    }

    #[test]
    fn test_producers_workers_collector() {
        const PRODUCERS: usize = 4;
        const PER: usize = 1000;

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let dups = Arc::new(AtomicUsize::new(0));

        let collector = EvThread::spawn_with("collector", fast(), |me| me.dispatch()).unwrap();
        let workers = EvThread::spawn_many("worker", PRODUCERS, |me| me.dispatch()).unwrap();
        assert_eq!(workers.len(), PRODUCERS);

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let workers = workers.clone();
                let collector = collector.clone();
                let seen = Arc::clone(&seen);
                let dups = Arc::clone(&dups);
                std::thread::spawn(move || {
                    for i in 0..PER {
                        let tag = p * PER + i;
                        let collector = collector.clone();
                        let seen = Arc::clone(&seen);
                        let dups = Arc::clone(&dups);
                        workers[i % workers.len()].post(move || {
                            collector.post(move || {
                                if !seen.lock().unwrap().insert(tag) {
                                    dups.fetch_add(1, Ordering::SeqCst);
                                }
                            });
                        });
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.lock().unwrap().len() < PRODUCERS * PER {
            assert!(Instant::now() < deadline, "collector timed out");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(seen.lock().unwrap().len(), PRODUCERS * PER);
        assert_eq!(dups.load(Ordering::SeqCst), 0);

        for w in &workers {
            assert!(w.kill_join());
        }
        assert!(collector.kill_join());
    }
}
