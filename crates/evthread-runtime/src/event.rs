//! Dispatch events
//!
//! A dispatch event is one boxed closure queued on a thread's FIFO. The
//! closure owns whatever it captured; the queue owns the event until it is
//! popped, then the dispatch loop owns it until the call returns.

use std::fmt;

use crate::thread::EvThread;

/// Queued unit of work
pub struct Event {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Event {
    #[inline]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Empty event used to kick a parked dispatch loop
    #[inline]
    pub(crate) fn wakeup() -> Self {
        Self::new(|| {})
    }

    /// Run the callback, consuming the event
    #[inline]
    pub fn call(self) {
        (self.f)()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Event")
    }
}

/// Enqueue `f` on `thread`.
///
/// Returns false (and drops `f` unrun) when the thread no longer accepts
/// events.
#[inline]
pub fn schedule<F>(thread: &EvThread, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    thread.post(f)
}
