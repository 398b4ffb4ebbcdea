//! Blocking multi-producer FIFO queue
//!
//! This is the per-thread event queue. Producers never take a lock on the
//! push path: items go into a lock-free crossbeam queue and a consumer is
//! only signalled when one is actually parked.
//!
//! # Design
//!
//! ```text
//!   producer ──push──► SegQueue / ArrayQueue ──try_pop──► consumer
//!       │                                                   ▲
//!       └── parked > 0 ? ──► Parker (Mutex<bool> + Condvar) ┘
//! ```
//!
//! A bounded queue uses `ArrayQueue::force_push`: when full, the oldest
//! item is displaced and handed back to the producer.
//!
//! Lost wakeups are prevented by a SeqCst store/load pair: the producer
//! publishes the item then reads `parked`, the consumer bumps `parked`
//! then re-checks the queue under the parker lock before waiting.

use crossbeam_queue::{ArrayQueue, SegQueue};

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

enum Storage<T> {
    Unbounded(SegQueue<T>),
    Bounded(ArrayQueue<T>),
}

impl<T> Storage<T> {
    #[inline]
    fn push(&self, item: T) -> Option<T> {
        match self {
            Storage::Unbounded(q) => {
                q.push(item);
                None
            }
            Storage::Bounded(q) => q.force_push(item),
        }
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        match self {
            Storage::Unbounded(q) => q.pop(),
            Storage::Bounded(q) => q.pop(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        match self {
            Storage::Unbounded(q) => q.len(),
            Storage::Bounded(q) => q.len(),
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        match self {
            Storage::Unbounded(q) => q.is_empty(),
            Storage::Bounded(q) => q.is_empty(),
        }
    }
}

/// Condvar-based parking for queue consumers
struct Parker {
    /// true = wake pending
    mutex: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl Parker {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn signal(&self, all: bool) {
        {
            let mut pending = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = true;
        }
        if all {
            self.condvar.notify_all();
        } else {
            self.condvar.notify_one();
        }
    }
}

/// Thread-safe FIFO queue with blocking, timed and non-blocking pop.
///
/// Pop order is strict arrival order. Any number of threads may push;
/// the owning thread normally pops, but every pop flavour is safe to call
/// from any thread.
pub struct FifoQueue<T> {
    storage: Storage<T>,
    parker: Parker,
    pushed: AtomicU64,
    purged: AtomicU64,
}

impl<T> FifoQueue<T> {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_storage(Storage::Unbounded(SegQueue::new()))
    }

    /// Create a bounded queue holding at most `max_size` items.
    ///
    /// Pushing onto a full queue drops the oldest item (head-drop).
    pub fn bounded(max_size: usize) -> Self {
        assert!(max_size > 0, "bounded FIFO needs max_size > 0");
        Self::with_storage(Storage::Bounded(ArrayQueue::new(max_size)))
    }

    fn with_storage(storage: Storage<T>) -> Self {
        Self {
            storage,
            parker: Parker::new(),
            pushed: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        }
    }

    /// Append `item` at the tail.
    ///
    /// Returns the purged item if a bounded queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let purged = self.storage.push(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if purged.is_some() {
            self.purged.fetch_add(1, Ordering::Relaxed);
        }

        fence(Ordering::SeqCst);
        if self.parker.parked.load(Ordering::SeqCst) > 0 {
            self.parker.signal(false);
        }
        purged
    }

    /// Non-blocking pop
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.storage.pop()
    }

    /// Pop, waiting up to `timeout` for an item.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` does not wait at all.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        match timeout {
            None => Some(self.pop_wait()),
            Some(t) if t.is_zero() => self.try_pop(),
            Some(t) => self.pop_timeout(t),
        }
    }

    /// Block until an item is available
    pub fn pop_wait(&self) -> T {
        loop {
            if let Some(item) = self.storage.pop() {
                return item;
            }
            self.park(None);
        }
    }

    /// Pop, giving up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.storage.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.park(Some(deadline - now));
        }
    }

    fn park(&self, timeout: Option<Duration>) {
        self.parker.parked.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let mut pending = self.parker.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending && self.storage.is_empty() {
            pending = match timeout {
                Some(t) => {
                    self.parker
                        .condvar
                        .wait_timeout(pending, t)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .parker
                    .condvar
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        *pending = false;
        drop(pending);

        self.parker.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake every parked consumer without pushing anything.
    ///
    /// Consumers return from their wait and re-check their own exit
    /// conditions (used when a thread is asked to stop).
    pub fn wake_all(&self) {
        self.parker.signal(true);
    }

    /// Number of queued items (approximate under concurrency)
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Maximum size for bounded queues
    pub fn capacity(&self) -> Option<usize> {
        match &self.storage {
            Storage::Unbounded(_) => None,
            Storage::Bounded(q) => Some(q.capacity()),
        }
    }

    /// Consumers currently parked in a pop (hint)
    #[inline]
    pub fn parked_count(&self) -> usize {
        self.parker.parked.load(Ordering::Relaxed)
    }

    /// Items pushed over the queue's lifetime
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Items displaced by head-drop over the queue's lifetime
    pub fn total_purged(&self) -> u64 {
        self.purged.load(Ordering::Relaxed)
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FifoQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("parked", &self.parked_count())
            .finish()
    }
}
