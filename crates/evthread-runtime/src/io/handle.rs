//! I/O handles
//!
//! One `IoHandle` per registered descriptor, shared through `Arc`. The
//! registry holds references while the descriptor is registered and every
//! queued readiness event holds one more, so a handle outlives `del()`
//! until the last queued event has been discarded.
//!
//! ```text
//!   Unregistered ── add ──► Registered ── del ──► Decommissioned ── last Arc ──► freed
//! ```
//!
//! Dropping a handle that is still registered is a contract violation.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use evthread_core::{kerror, HandleToken};

use crate::io::interest::Interest;
use crate::io::pool::IoWorker;
use crate::thread::EvThread;

/// Readiness handler
pub type IoHandler = Arc<dyn Fn(&IoEvent) + Send + Sync + 'static>;

/// What a handler receives
#[derive(Debug, Clone)]
pub struct IoEvent {
    pub fd: RawFd,
    /// Ready bits reported by the kernel
    pub events: Interest,
    /// Thread the registration named as its context
    pub target: Option<EvThread>,
}

/// How a handler may behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// Handler may block; runs on a pooled worker thread
    MayBlock,
    /// Handler only does non-blocking work; runs inline on the I/O thread
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    Unregistered = 0,
    Registered = 1,
    Decommissioned = 2,
}

impl From<u8> for HandleState {
    fn from(v: u8) -> Self {
        match v {
            0 => HandleState::Unregistered,
            1 => HandleState::Registered,
            _ => HandleState::Decommissioned,
        }
    }
}

struct HandleInner {
    interest: Interest,
    mode: HandlerMode,
    target: Option<EvThread>,
    handler: IoHandler,
    worker: Option<Arc<IoWorker>>,
}

pub struct IoHandle {
    fd: RawFd,
    token: HandleToken,
    state: AtomicU8,
    /// Readiness events queued on a worker and not yet finished
    pending: AtomicUsize,
    inner: Mutex<HandleInner>,
}

impl IoHandle {
    pub(crate) fn new(
        fd: RawFd,
        interest: Interest,
        mode: HandlerMode,
        target: Option<EvThread>,
        handler: IoHandler,
    ) -> Self {
        Self {
            fd,
            token: HandleToken::next(),
            state: AtomicU8::new(HandleState::Unregistered as u8),
            pending: AtomicUsize::new(0),
            inner: Mutex::new(HandleInner {
                interest,
                mode,
                target,
                handler,
                worker: None,
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn token(&self) -> HandleToken {
        self.token
    }

    #[inline]
    pub fn state(&self) -> HandleState {
        HandleState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_decommissioned(&self) -> bool {
        self.state() == HandleState::Decommissioned
    }

    /// Queued readiness events not yet finished
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn interest(&self) -> Interest {
        self.lock().interest
    }

    pub fn mode(&self) -> HandlerMode {
        self.lock().mode
    }

    pub fn target(&self) -> Option<EvThread> {
        self.lock().target.clone()
    }

    /// Replace the registration parameters (re-add of a registered fd)
    pub(crate) fn update(
        &self,
        interest: Interest,
        mode: HandlerMode,
        target: Option<EvThread>,
        handler: IoHandler,
    ) {
        let mut inner = self.lock();
        inner.interest = interest;
        inner.mode = mode;
        inner.target = target;
        inner.handler = handler;
    }

    pub(crate) fn mark_registered(&self) {
        let _ = self.state.compare_exchange(
            HandleState::Unregistered as u8,
            HandleState::Registered as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Returns true on the first call.
    ///
    /// Serialized with `invoke` by the handle lock: once this returns no
    /// new handler call begins.
    pub(crate) fn decommission(&self) -> bool {
        let mut inner = self.lock();
        let prev = self.state.swap(HandleState::Decommissioned as u8, Ordering::AcqRel);
        if prev == HandleState::Decommissioned as u8 {
            return false;
        }
        // Break the worker reference now; queued events hold their own
        inner.worker = None;
        true
    }

    pub(crate) fn worker(&self) -> Option<Arc<IoWorker>> {
        self.lock().worker.clone()
    }

    pub(crate) fn set_worker(&self, worker: Option<Arc<IoWorker>>) {
        self.lock().worker = worker;
    }

    /// Run the handler for `events` on the calling thread.
    ///
    /// Returns false without calling it once the handle is decommissioned.
    pub(crate) fn invoke(&self, events: Interest) -> bool {
        let (handler, target) = {
            let inner = self.lock();
            if self.is_decommissioned() {
                return false;
            }
            (Arc::clone(&inner.handler), inner.target.clone())
        };
        handler(&IoEvent {
            fd: self.fd,
            events,
            target,
        });
        true
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        if self.state() == HandleState::Registered {
            kerror!("I/O handle for fd {} dropped while still registered", self.fd);
            debug_assert!(false, "I/O handle for fd {} dropped while registered", self.fd);
        }
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// One queued readiness event; keeps the handle alive and counted
pub(crate) struct PendingEvent {
    handle: Arc<IoHandle>,
}

impl PendingEvent {
    pub(crate) fn new(handle: Arc<IoHandle>) -> Self {
        handle.pending.fetch_add(1, Ordering::AcqRel);
        Self { handle }
    }

    #[inline]
    pub(crate) fn handle(&self) -> &IoHandle {
        &self.handle
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        self.handle.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn handle_with(tx: mpsc::Sender<IoEvent>) -> IoHandle {
        let handler: IoHandler = Arc::new(move |ev: &IoEvent| {
            tx.send(ev.clone()).unwrap();
        });
        IoHandle::new(
            5,
            Interest::READABLE,
            HandlerMode::MayBlock,
            Some(EvThread::current()),
            handler,
        )
    }

    #[test]
    fn test_state_transitions() {
        let (tx, _rx) = mpsc::channel();
        let h = handle_with(tx);
        assert_eq!(h.state(), HandleState::Unregistered);
        h.mark_registered();
        assert_eq!(h.state(), HandleState::Registered);
        assert!(h.decommission());
        assert!(!h.decommission());
        assert!(h.is_decommissioned());
        // Never goes back
        h.mark_registered();
        assert!(h.is_decommissioned());
    }

    #[test]
    fn test_invoke_passes_context() {
        let (tx, rx) = mpsc::channel();
        let h = handle_with(tx);
        assert!(h.invoke(Interest::READABLE | Interest::HANGUP));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.fd, 5);
        assert!(ev.events.is_readable());
        assert!(ev.events.is_closed());
        assert_eq!(ev.target, Some(EvThread::current()));
    }

    #[test]
    fn test_no_invoke_after_decommission() {
        let (tx, rx) = mpsc::channel();
        let h = handle_with(tx);
        h.mark_registered();
        assert!(h.invoke(Interest::READABLE));
        rx.try_recv().unwrap();

        h.decommission();
        assert!(!h.invoke(Interest::READABLE));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pending_event_counts_and_holds() {
        let (tx, _rx) = mpsc::channel();
        let h = Arc::new(handle_with(tx));
        let weak = Arc::downgrade(&h);

        let a = PendingEvent::new(Arc::clone(&h));
        let b = PendingEvent::new(Arc::clone(&h));
        assert_eq!(h.pending(), 2);
        assert_eq!(a.handle().fd(), 5);

        drop(h);
        assert!(weak.upgrade().is_some());
        drop(a);
        drop(b);
        assert!(weak.upgrade().is_none());
    }
}
