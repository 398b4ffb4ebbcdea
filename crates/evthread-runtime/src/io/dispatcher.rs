//! I/O dispatcher
//!
//! One "io" thread waits on the readiness backend and routes each ready
//! descriptor to its handler. Both the thread and the backend are created
//! by the first `add()`.
//!
//! `MayBlock` descriptors are registered one-shot: the kernel reports them
//! once, then they stay disarmed until the worker job for that report has
//! finished and re-armed them. A level-triggered descriptor whose handler
//! is still running is therefore not reported again.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use evthread_core::{kdebug, kerror, kinfo, ktrace, kwarn, RtError, RtResult};

use crate::config::RuntimeConfig;
use crate::io::handle::{HandlerMode, IoEvent, IoHandle, IoHandler, PendingEvent};
use crate::io::interest::Interest;
use crate::io::poller::{new_backend, Readiness, ReadinessBackend};
use crate::io::pool::{IoWorker, IoWorkerPool};
use crate::thread::{EvThread, ThreadOptions};

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct IoConfig {
    pub workers_max: usize,
    pub retry_wait: Duration,
    pub migrate_wait: Duration,
    pub epoll_size: usize,
    pub max_events: usize,
    pub poll_interval: Duration,
}

impl From<&RuntimeConfig> for IoConfig {
    fn from(c: &RuntimeConfig) -> Self {
        Self {
            workers_max: c.io_workers_max,
            retry_wait: c.io_retry_wait,
            migrate_wait: c.io_migrate_wait,
            epoll_size: c.io_epoll_size,
            max_events: c.io_max_events,
            poll_interval: c.poll_interval,
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::from(crate::config::global())
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Descriptors currently registered
    pub registered: usize,
    /// Workers created
    pub workers: usize,
    /// Handlers run inline on the I/O thread
    pub inline: u64,
    /// Events queued on workers
    pub queued: u64,
    /// Readiness for deleted or unknown descriptors
    pub discarded: u64,
    /// Descriptors moved off a busy sticky worker
    pub migrations: u64,
}

#[derive(Default)]
struct Registry {
    by_fd: HashMap<RawFd, Arc<IoHandle>>,
    by_token: HashMap<u64, Arc<IoHandle>>,
}

struct Reactor {
    backend: Arc<dyn ReadinessBackend>,
    thread: EvThread,
}

#[derive(Default)]
struct Counters {
    inline: AtomicU64,
    queued: AtomicU64,
    discarded: AtomicU64,
    migrations: AtomicU64,
}

struct Shared {
    config: IoConfig,
    registry: Mutex<Registry>,
    reactor: Mutex<Option<Reactor>>,
    pool: Arc<IoWorkerPool>,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Descriptor readiness dispatcher
#[derive(Clone)]
pub struct IoDispatcher {
    shared: Arc<Shared>,
}

impl IoDispatcher {
    pub fn new(config: IoConfig) -> Self {
        let pool = IoWorkerPool::new(config.workers_max, config.retry_wait, config.poll_interval);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::default()),
                reactor: Mutex::new(None),
                pool,
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(IoConfig::from(config))
    }

    /// Register `fd` (or update its registration).
    ///
    /// Readiness matching `interest` calls `handler` with an `IoEvent`
    /// carrying `target` as context. `MayBlock` handlers run on a worker
    /// thread, one worker per descriptor at a time; `NonBlocking` handlers
    /// run on the I/O thread. An empty `interest` is `del(fd)`.
    pub fn add<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        mode: HandlerMode,
        target: Option<&EvThread>,
        handler: F,
    ) -> RtResult<()>
    where
        F: Fn(&IoEvent) + Send + Sync + 'static,
    {
        self.add_handler(fd, interest, mode, target.cloned(), Arc::new(handler))
    }

    pub fn add_handler(
        &self,
        fd: RawFd,
        interest: Interest,
        mode: HandlerMode,
        target: Option<EvThread>,
        handler: IoHandler,
    ) -> RtResult<()> {
        if interest.is_empty() {
            self.del(fd);
            return Ok(());
        }
        if fd < 0 {
            return Err(RtError::InvalidFd(fd));
        }
        let backend = self.shared.backend()?;

        let mut reg = self.shared.lock_registry();
        if let Some(handle) = reg.by_fd.get(&fd).cloned() {
            handle.update(interest, mode, target, handler);
            return backend
                .modify(fd, handle.token().as_u64(), registered_interest(interest, mode))
                .map_err(|errno| {
                    kwarn!("epoll MOD of fd {} failed: errno {}", fd, errno);
                    RtError::Register { fd, errno }
                });
        }

        let handle = Arc::new(IoHandle::new(fd, interest, mode, target, handler));
        let token = handle.token().as_u64();
        match backend.register(fd, token, registered_interest(interest, mode)) {
            Ok(()) => {
                handle.mark_registered();
                reg.by_token.insert(token, Arc::clone(&handle));
                reg.by_fd.insert(fd, handle);
                ktrace!("fd {} registered ({:?})", fd, interest);
                Ok(())
            }
            Err(errno) => {
                kwarn!("epoll ADD of fd {} failed: errno {}", fd, errno);
                handle.decommission();
                Err(RtError::Register { fd, errno })
            }
        }
    }

    /// Unregister `fd`. Returns false if it was not registered.
    ///
    /// Events already queued for `fd` are discarded and no handler call
    /// begins after this returns. A call already under way on another
    /// thread is not waited for.
    pub fn del(&self, fd: RawFd) -> bool {
        let handle = {
            let mut reg = self.shared.lock_registry();
            let Some(handle) = reg.by_fd.remove(&fd) else {
                return false;
            };
            reg.by_token.remove(&handle.token().as_u64());
            handle
        };

        handle.decommission();
        if let Some(backend) = self.shared.running_backend() {
            if let Err(errno) = backend.unregister(fd) {
                kwarn!("epoll DEL of fd {} failed: errno {}", fd, errno);
            }
        }
        ktrace!("fd {} deleted ({} events pending)", fd, handle.pending());
        true
    }

    /// Current handle of `fd`
    pub fn handle(&self, fd: RawFd) -> Option<Arc<IoHandle>> {
        self.shared.lock_registry().by_fd.get(&fd).cloned()
    }

    pub fn is_started(&self) -> bool {
        self.shared.running_backend().is_some()
    }

    pub fn stats(&self) -> IoStats {
        let c = &self.shared.counters;
        IoStats {
            registered: self.shared.lock_registry().by_fd.len(),
            workers: self.shared.pool.len(),
            inline: c.inline.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            migrations: c.migrations.load(Ordering::Relaxed),
        }
    }

    /// Unregister everything, stop the I/O thread and the worker pool
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<_> = {
            let mut reg = self.shared.lock_registry();
            reg.by_token.clear();
            reg.by_fd.drain().map(|(_, h)| h).collect()
        };
        let reactor = self
            .shared
            .reactor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        for h in &handles {
            h.decommission();
            if let Some(r) = &reactor {
                let _ = r.backend.unregister(h.fd());
            }
        }
        if let Some(r) = reactor {
            if let Err(errno) = r.backend.wake() {
                kerror!("failed to wake I/O thread: errno {}", errno);
            }
            r.thread.join();
        }
        self.shared.pool.shutdown();
        kdebug!("I/O dispatcher stopped ({} descriptors dropped)", handles.len());
    }
}

impl Shared {
    #[inline]
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_backend(&self) -> Option<Arc<dyn ReadinessBackend>> {
        self.reactor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| Arc::clone(&r.backend))
    }

    /// Backend, starting the I/O thread on first use
    fn backend(self: &Arc<Self>) -> RtResult<Arc<dyn ReadinessBackend>> {
        let mut reactor = self.reactor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = reactor.as_ref() {
            return Ok(Arc::clone(&r.backend));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RtError::ShutDown);
        }

        let backend: Arc<dyn ReadinessBackend> = Arc::from(
            new_backend(self.config.epoll_size, self.config.max_events).map_err(|errno| {
                kerror!("failed to create epoll instance: errno {}", errno);
                RtError::PollerCreate(errno)
            })?,
        );

        let shared = Arc::clone(self);
        let b = Arc::clone(&backend);
        let thread = EvThread::spawn_with(
            "io",
            ThreadOptions::service(self.config.poll_interval),
            move |me| shared.readiness_loop(b, me),
        )?;
        kinfo!("I/O thread started");

        *reactor = Some(Reactor {
            backend: Arc::clone(&backend),
            thread,
        });
        Ok(backend)
    }

    fn readiness_loop(self: Arc<Self>, backend: Arc<dyn ReadinessBackend>, me: &EvThread) {
        let mut ready = Vec::with_capacity(self.config.max_events);
        while me.is_running() && !self.shutdown.load(Ordering::Acquire) {
            ready.clear();
            match backend.wait(&mut ready, None) {
                Ok(_) => {}
                Err(errno) if errno == libc::EINTR => continue,
                Err(errno) => {
                    kerror!("epoll_wait failed: errno {}", errno);
                    break;
                }
            }
            for r in &ready {
                self.route(r, &backend);
            }
        }
        kdebug!("I/O thread leaving readiness loop");
    }

    fn route(self: &Arc<Self>, r: &Readiness, backend: &Arc<dyn ReadinessBackend>) {
        let handle = self.lock_registry().by_token.get(&r.token).cloned();
        let Some(handle) = handle.filter(|h| !h.is_decommissioned()) else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match handle.mode() {
            HandlerMode::NonBlocking => {
                if handle.invoke(r.events) {
                    self.counters.inline.fetch_add(1, Ordering::Relaxed);
                }
            }
            HandlerMode::MayBlock => self.route_to_worker(handle, r.events, backend),
        }
    }

    fn route_to_worker(
        self: &Arc<Self>,
        handle: Arc<IoHandle>,
        events: Interest,
        backend: &Arc<dyn ReadinessBackend>,
    ) {
        let worker = match self.pick_worker(&handle) {
            Ok(w) => w,
            Err(e) => {
                kdebug!("fd {}: no worker ({}), event dropped", handle.fd(), e);
                return;
            }
        };

        let pending = PendingEvent::new(handle);
        let shared = Arc::clone(self);
        let backend = Arc::clone(backend);
        let posted = self.pool.submit(&worker, move || {
            let h = pending.handle();
            if h.invoke(events) {
                shared.rearm(h, backend.as_ref());
            } else {
                ktrace!("fd {}: queued event discarded", h.fd());
            }
        });
        if posted {
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Re-enable a one-shot descriptor after its handler ran, unless it was
    /// deleted, replaced or switched to `NonBlocking` meanwhile
    fn rearm(&self, handle: &IoHandle, backend: &dyn ReadinessBackend) {
        let reg = self.lock_registry();
        let current = reg
            .by_fd
            .get(&handle.fd())
            .map_or(false, |h| std::ptr::eq(Arc::as_ptr(h), handle));
        if !current || handle.is_decommissioned() || handle.mode() != HandlerMode::MayBlock {
            return;
        }
        let interest = registered_interest(handle.interest(), HandlerMode::MayBlock);
        match backend.modify(handle.fd(), handle.token().as_u64(), interest) {
            Ok(()) => {}
            Err(errno) if errno == libc::ENOENT || errno == libc::EBADF => {
                ktrace!("fd {}: gone before re-arm", handle.fd());
            }
            Err(errno) => kwarn!("epoll re-arm of fd {} failed: errno {}", handle.fd(), errno),
        }
    }

    /// Sticky worker, unless it is gone or busy with another descriptor
    /// past the migrate wait while this one has nothing queued
    fn pick_worker(&self, handle: &IoHandle) -> RtResult<Arc<IoWorker>> {
        if let Some(w) = handle.worker() {
            let migrate = handle.pending() == 0
                && w.busy_for().map_or(false, |b| b > self.config.migrate_wait);
            if !migrate && w.thread().is_running() {
                return Ok(w);
            }
            if migrate {
                self.counters.migrations.fetch_add(1, Ordering::Relaxed);
                kdebug!("fd {} migrating off busy worker '{}'", handle.fd(), w.thread().name());
            }
        }

        let w = self.pool.acquire()?;
        if !handle.is_decommissioned() {
            handle.set_worker(Some(Arc::clone(&w)));
        }
        Ok(w)
    }
}

/// Interest as handed to the backend for a handler mode
fn registered_interest(interest: Interest, mode: HandlerMode) -> Interest {
    match mode {
        HandlerMode::MayBlock => interest | Interest::ONESHOT,
        HandlerMode::NonBlocking => interest,
    }
}
