//! Thread-local storage for the current event thread
//!
//! Each OS thread has at most one `EvThread` handle installed. Lookup is a
//! plain thread-local read, no lock involved.

use std::cell::RefCell;

use crate::thread::EvThread;

thread_local! {
    static CURRENT: RefCell<Option<EvThread>> = const { RefCell::new(None) };
}

/// Install `thread` as the current thread's handle
#[inline]
pub(crate) fn set_current(thread: EvThread) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(thread));
}

/// Remove the current handle (thread-local cleanup on exit)
#[inline]
pub(crate) fn clear_current() -> Option<EvThread> {
    CURRENT
        .try_with(|cell| cell.borrow_mut().take())
        .ok()
        .flatten()
}

/// Current thread's handle, if one is installed
#[inline]
pub fn try_current() -> Option<EvThread> {
    CURRENT.try_with(|cell| cell.borrow().clone()).ok().flatten()
}

/// Check if the calling OS thread has a runtime handle
#[inline]
pub fn has_current() -> bool {
    CURRENT
        .try_with(|cell| cell.borrow().is_some())
        .unwrap_or(false)
}
