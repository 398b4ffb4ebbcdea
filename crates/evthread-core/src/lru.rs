//! Idle cache
//!
//! Entries are pushed when they become idle and popped most recently
//! pushed first, so the warmest entry is reused and cold ones age out at
//! the back. The I/O worker pool keeps its idle threads here.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex-protected idle cache (newest at the front)
pub struct IdleLru<T> {
    entries: Mutex<VecDeque<T>>,
}

impl<T> IdleLru<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an entry as the youngest
    pub fn push(&self, entry: T) {
        self.lock().push_front(entry);
    }

    /// Remove and return the youngest entry
    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Take every entry, youngest first
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T> Default for IdleLru<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youngest_first() {
        let lru = IdleLru::new();
        lru.push(1);
        lru.push(2);
        lru.push(3);

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.pop(), Some(3));
        lru.push(4);
        assert_eq!(lru.pop(), Some(4));
        assert_eq!(lru.pop(), Some(2));
        assert_eq!(lru.pop(), Some(1));
        assert_eq!(lru.pop(), None);
        assert!(lru.is_empty());
    }

    #[test]
    fn test_drain_youngest_first() {
        let lru = IdleLru::new();
        for i in 0..4 {
            lru.push(i);
        }
        assert_eq!(lru.drain(), vec![3, 2, 1, 0]);
        assert!(lru.is_empty());
    }
}
