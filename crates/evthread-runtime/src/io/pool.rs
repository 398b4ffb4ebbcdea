//! I/O worker pool
//!
//! Blocking handlers run on pooled worker threads ("io:0", "io:1", ...).
//! A worker whose queue drains returns itself to the idle cache; acquiring
//! takes the most recently idled worker first, spawns a new one below the
//! cap, and otherwise sleeps and retries.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use evthread_core::clock::now_us;
use evthread_core::{kdebug, kerror, IdleLru, RtError, RtResult};

use crate::thread::{EvThread, ThreadOptions};

/// A pooled worker thread
pub struct IoWorker {
    thread: EvThread,
    /// Start of the job in progress (0 = idle)
    busy_since_us: AtomicU64,
    /// Jobs posted and not yet finished
    queued: AtomicUsize,
    in_idle: AtomicBool,
}

impl IoWorker {
    #[inline]
    pub fn thread(&self) -> &EvThread {
        &self.thread
    }

    /// How long the current job has been running
    pub fn busy_for(&self) -> Option<Duration> {
        match self.busy_since_us.load(Ordering::Acquire) {
            0 => None,
            since => Some(Duration::from_micros(now_us().saturating_sub(since))),
        }
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for IoWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWorker")
            .field("thread", &self.thread.name())
            .field("queued", &self.queued())
            .field("busy_for", &self.busy_for())
            .finish()
    }
}

/// Bounded pool of worker threads
pub struct IoWorkerPool {
    idle: IdleLru<Arc<IoWorker>>,
    all: Mutex<Vec<Arc<IoWorker>>>,
    spawned: AtomicUsize,
    max: usize,
    retry_wait: Duration,
    poll_interval: Duration,
    shutdown: AtomicBool,
    waits: AtomicU64,
}

impl IoWorkerPool {
    pub fn new(max: usize, retry_wait: Duration, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            idle: IdleLru::new(),
            all: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            max: max.max(1),
            retry_wait,
            poll_interval,
            shutdown: AtomicBool::new(false),
            waits: AtomicU64::new(0),
        })
    }

    /// Get a worker: idle first, then a new one, otherwise wait and retry.
    ///
    /// Only fails once the pool is shut down.
    pub fn acquire(&self) -> RtResult<Arc<IoWorker>> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(RtError::ShutDown);
            }
            if let Some(w) = self.idle.pop() {
                w.in_idle.store(false, Ordering::Release);
                return Ok(w);
            }

            let slot = self
                .spawned
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.max).then_some(n + 1)
                });
            match slot {
                Ok(n) => match self.spawn_worker(n) {
                    Ok(w) => return Ok(w),
                    Err(e) => {
                        self.spawned.fetch_sub(1, Ordering::AcqRel);
                        kerror!("failed to create I/O worker io:{}: {}", n, e);
                    }
                },
                Err(_) => {
                    if self.waits.fetch_add(1, Ordering::Relaxed) % 100 == 0 {
                        kdebug!("out of I/O worker threads ({}), waiting", self.max);
                    }
                }
            }
            std::thread::sleep(self.retry_wait);
        }
    }

    fn spawn_worker(&self, n: usize) -> RtResult<Arc<IoWorker>> {
        let thread = EvThread::spawn_with(
            &format!("io:{}", n),
            ThreadOptions::service(self.poll_interval),
            |me| me.dispatch(),
        )?;
        let worker = Arc::new(IoWorker {
            thread,
            busy_since_us: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            in_idle: AtomicBool::new(false),
        });
        self.all
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&worker));
        kdebug!("created I/O worker io:{}", n);
        Ok(worker)
    }

    /// Queue `job` on `worker`. The worker rejoins the idle cache once its
    /// queue drains.
    ///
    /// Returns false (dropping `job`) if the worker no longer runs.
    pub fn submit<F>(self: &Arc<Self>, worker: &Arc<IoWorker>, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        worker.queued.fetch_add(1, Ordering::AcqRel);
        let pool = Arc::clone(self);
        let w = Arc::clone(worker);

        let posted = worker.thread.post(move || {
            w.busy_since_us.store(now_us().max(1), Ordering::Release);
            job();
            w.busy_since_us.store(0, Ordering::Release);
            if w.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
                pool.release(&w);
            }
        });
        if !posted {
            worker.queued.fetch_sub(1, Ordering::AcqRel);
        }
        posted
    }

    fn release(&self, worker: &Arc<IoWorker>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if !worker.in_idle.swap(true, Ordering::AcqRel) {
            self.idle.push(Arc::clone(worker));
        }
    }

    /// Workers created so far
    pub fn len(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Stop and join every worker
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.idle.drain();
        let workers = std::mem::take(&mut *self.all.lock().unwrap_or_else(PoisonError::into_inner));
        for w in &workers {
            w.thread.kill();
        }
        for w in &workers {
            w.thread.join();
        }
        kdebug!("I/O worker pool stopped ({} workers)", workers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn pool(max: usize) -> Arc<IoWorkerPool> {
        IoWorkerPool::new(max, Duration::from_millis(2), Duration::from_millis(20))
    }

    fn wait_idle(p: &IoWorkerPool, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while p.idle_count() < n {
            assert!(Instant::now() < deadline, "workers never went idle");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_worker_returns_to_idle_and_is_reused() {
        let p = pool(4);
        let w = p.acquire().unwrap();
        assert_eq!(w.thread().name(), "io:0");
        assert_eq!(p.len(), 1);

        let (tx, rx) = mpsc::channel();
        assert!(p.submit(&w, move || tx.send(EvThread::current().name().to_string()).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "io:0");

        wait_idle(&p, 1);
        let again = p.acquire().unwrap();
        assert!(Arc::ptr_eq(&w, &again));
        assert_eq!(p.len(), 1);

        p.shutdown();
        assert!(matches!(p.acquire(), Err(RtError::ShutDown)));
    }

    #[test]
    fn test_youngest_idle_worker_first() {
        let p = pool(4);
        let a = p.acquire().unwrap();
        let b = p.acquire().unwrap();
        assert_eq!(b.thread().name(), "io:1");

        p.submit(&a, || {});
        wait_idle(&p, 1);
        p.submit(&b, || {});
        wait_idle(&p, 2);

        assert!(Arc::ptr_eq(&p.acquire().unwrap(), &b));
        assert!(Arc::ptr_eq(&p.acquire().unwrap(), &a));
        p.shutdown();
    }

    #[test]
    fn test_cap_waits_for_a_worker() {
        let p = pool(1);
        let w = p.acquire().unwrap();
        p.submit(&w, || std::thread::sleep(Duration::from_millis(60)));

        let start = Instant::now();
        let again = p.acquire().unwrap();
        assert!(Arc::ptr_eq(&w, &again));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(p.len(), 1);
        p.shutdown();
    }

    #[test]
    fn test_busy_tracking() {
        let p = pool(1);
        let w = p.acquire().unwrap();
        assert_eq!(w.busy_for(), None);

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        p.submit(&w, move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert!(w.busy_for().unwrap() >= Duration::from_millis(10));
        assert_eq!(w.queued(), 1);

        release_tx.send(()).unwrap();
        wait_idle(&p, 1);
        assert_eq!(w.busy_for(), None);
        p.shutdown();
    }
}
