//! Readiness interest / event bits
//!
//! Values are the epoll bits, so an `Interest` passes straight through to
//! `epoll_ctl` and readiness reported by `epoll_wait` comes back as one.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const PRIORITY: Interest = Interest(libc::EPOLLPRI as u32);
    /// Peer closed its writing half
    pub const READ_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Always reported, need not be requested
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    /// Always reported, need not be requested
    pub const HANGUP: Interest = Interest(libc::EPOLLHUP as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Disabled after one report until modified again
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Interest(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Error or hangup reported
    #[inline]
    pub const fn is_closed(self) -> bool {
        self.0 & (Self::ERROR.0 | Self::HANGUP.0) != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, rhs: Self) -> Self {
        Interest(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Interest, &str); 8] = [
            (Interest::READABLE, "IN"),
            (Interest::WRITABLE, "OUT"),
            (Interest::PRIORITY, "PRI"),
            (Interest::READ_HANGUP, "RDHUP"),
            (Interest::ERROR, "ERR"),
            (Interest::HANGUP, "HUP"),
            (Interest::EDGE, "ET"),
            (Interest::ONESHOT, "ONESHOT"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_closed());
        assert!(!i.contains(Interest::NONE));
        assert!(Interest::NONE.is_empty());
        assert_eq!((i & Interest::WRITABLE), Interest::WRITABLE);
        assert_eq!(format!("{:?}", i), "IN|OUT");
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert!(Interest::from_bits(libc::EPOLLHUP as u32).is_closed());
        assert_eq!(format!("{:?}", Interest::READABLE | Interest::ONESHOT), "IN|ONESHOT");
    }
}
