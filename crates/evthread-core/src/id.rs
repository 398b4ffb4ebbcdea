//! Identifier types
//!
//! Threads, timers and I/O handles are identified by process-unique 64-bit
//! values handed out from monotonically increasing counters. Zero is never
//! allocated.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next unique identifier
            #[inline]
            pub fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                $name(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Wrap a raw value
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Get the raw value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier of a runtime thread
    ThreadId,
    "ThreadId"
);

define_id!(
    /// Unique identifier of a timer
    TimerId,
    "TimerId"
);

define_id!(
    /// Token tagging an I/O handle's readiness registration
    ///
    /// Each registration gets a fresh token, so readiness reported for a
    /// descriptor that was deleted and re-added never reaches the old handle.
    HandleToken,
    "HandleToken"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uniqueness() {
        let ids: Vec<_> = (0..1000).map(|_| TimerId::next()).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert!(ids.iter().all(|id| id.as_u64() != 0));
    }

    #[test]
    fn test_formatting() {
        let id = ThreadId::from_raw(7);
        assert_eq!(format!("{:?}", id), "ThreadId(7)");
        assert_eq!(format!("{}", id), "7");
        assert_eq!(HandleToken::from_raw(3).as_u64(), 3);
    }
}
