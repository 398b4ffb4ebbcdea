//! Thread lifecycle state

use core::fmt;

/// State of a runtime thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Handle allocated, OS thread not started yet
    Created = 0,

    /// Running its start function / dispatch loop
    Running = 1,

    /// Asked to stop; the dispatch loop returns at its next check
    Exiting = 2,

    /// Start function returned and thread-local state was cleaned up
    Exited = 3,
}

impl ThreadState {
    /// Check if the thread may still accept and run events
    #[inline]
    pub const fn is_live(&self) -> bool {
        matches!(self, ThreadState::Created | ThreadState::Running)
    }

    /// Check if the thread has finished
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, ThreadState::Exited)
    }
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Created,
            1 => ThreadState::Running,
            2 => ThreadState::Exiting,
            _ => ThreadState::Exited,
        }
    }
}

impl From<ThreadState> for u8 {
    fn from(state: ThreadState) -> u8 {
        state as u8
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Created => write!(f, "CREATED"),
            ThreadState::Running => write!(f, "RUNNING"),
            ThreadState::Exiting => write!(f, "EXITING"),
            ThreadState::Exited => write!(f, "EXITED"),
        }
    }
}
