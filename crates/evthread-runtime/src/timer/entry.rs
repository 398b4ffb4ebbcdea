//! Timer entries
//!
//! One `TimerSlot` per live timer, owned by the engine map and only touched
//! under the engine lock. The slot is an explicit state machine:
//!
//! ```text
//!            start                 due (called += 1)
//!   Idle ───────────► Armed ───────────────────────► Idle (firing)
//!    ▲  ◄──── stop ────┘                               │ completion (called -= 1)
//!    │                                                 ├─► Armed   RECURRING, not stopped
//!    └─────────────────────────────────────────────────┼─► Idle    ONCE
//!                                                      └─► Freed   ATOMIC ONCE
//!
//!   destroy: called == 0 ─► Freed
//!            called > 0  ─► Removed ── last completion ──► Freed
//! ```

use std::sync::{Arc, Mutex};

use evthread_core::Micros;

use crate::thread::EvThread;
use crate::timer::Timer;

/// Timer callback; runs on the target thread with the firing timer
pub type TimerCallback = Box<dyn FnMut(&Timer) + Send + 'static>;

/// Timer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once per start
    Once,
    /// Fire every interval until stopped
    Recurring,
}

/// Observable state of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not armed, nothing in flight
    Idle,
    /// In the pending set
    Armed,
    /// Not armed, at least one firing queued or running
    Firing,
    /// Destroyed while firing; freed by the last completion
    Removed,
    /// Gone
    Freed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Armed { due_us: Micros, seq: u64 },
    Removed,
}

/// Result of `TimerSlot::destroy`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destroy {
    Free,
    Deferred,
}

/// Result of `TimerSlot::complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Keep,
    Rearm(Micros),
    Free,
}

pub(crate) struct TimerSlot {
    pub(crate) kind: TimerKind,
    /// Engine-owned: freed by the engine after its last firing
    pub(crate) atomic: bool,
    pub(crate) phase: Phase,
    /// Firings queued or executing
    pub(crate) called: u32,
    pub(crate) interval_us: Micros,
    /// Cleared by stop(); a recurring timer re-arms at completion only when set
    pub(crate) rearm: bool,
    pub(crate) target: EvThread,
    pub(crate) callback: Arc<Mutex<TimerCallback>>,
}

impl TimerSlot {
    pub(crate) fn new(kind: TimerKind, atomic: bool, target: EvThread, callback: TimerCallback) -> Self {
        Self {
            kind,
            atomic,
            phase: Phase::Idle,
            called: 0,
            interval_us: 0,
            rearm: false,
            target,
            callback: Arc::new(Mutex::new(callback)),
        }
    }

    pub(crate) fn state(&self) -> TimerState {
        match self.phase {
            Phase::Removed => TimerState::Removed,
            Phase::Armed { .. } => TimerState::Armed,
            Phase::Idle if self.called > 0 => TimerState::Firing,
            Phase::Idle => TimerState::Idle,
        }
    }

    #[inline]
    pub(crate) fn due_us(&self) -> Option<Micros> {
        match self.phase {
            Phase::Armed { due_us, .. } => Some(due_us),
            _ => None,
        }
    }

    /// Whether the heap entry `(due_us, seq)` is this slot's live arming
    #[inline]
    pub(crate) fn is_armed_as(&self, seq: u64) -> bool {
        matches!(self.phase, Phase::Armed { seq: s, .. } if s == seq)
    }

    pub(crate) fn arm(&mut self, interval_us: Micros, due_us: Micros, seq: u64) {
        debug_assert!(self.phase != Phase::Removed);
        self.interval_us = interval_us;
        self.rearm = true;
        self.phase = Phase::Armed { due_us, seq };
    }

    /// Leave the pending set; returns true if the timer was armed
    pub(crate) fn disarm(&mut self) -> bool {
        self.rearm = false;
        match self.phase {
            Phase::Armed { .. } => {
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    /// Armed -> firing. Returns the deadline that fired.
    ///
    /// Exceeding `limit` outstanding firings is a protocol violation.
    pub(crate) fn fire(&mut self, limit: u32) -> Micros {
        let due_us = match self.phase {
            Phase::Armed { due_us, .. } => due_us,
            other => panic!("firing a timer that is not armed ({:?})", other),
        };
        assert!(
            self.called < limit,
            "timer has {} outstanding firings (limit {})",
            self.called,
            limit
        );
        self.phase = Phase::Idle;
        self.called += 1;
        due_us
    }

    pub(crate) fn destroy(&mut self) -> Destroy {
        self.disarm();
        if self.called > 0 {
            self.phase = Phase::Removed;
            Destroy::Deferred
        } else {
            Destroy::Free
        }
    }

    /// One firing finished on the target thread.
    ///
    /// `due_us` is the deadline that fired; recurring timers re-arm from it,
    /// skipping periods already in the past.
    pub(crate) fn complete(&mut self, due_us: Micros, now_us: Micros) -> Completion {
        assert!(self.called > 0, "timer completion without a firing");
        self.called -= 1;

        match self.phase {
            Phase::Removed if self.called == 0 => Completion::Free,
            Phase::Removed | Phase::Armed { .. } => Completion::Keep,
            Phase::Idle => match self.kind {
                TimerKind::Recurring if self.rearm => {
                    Completion::Rearm(next_deadline(due_us, self.interval_us, now_us))
                }
                TimerKind::Recurring => Completion::Keep,
                TimerKind::Once if self.atomic && self.called == 0 => Completion::Free,
                TimerKind::Once => Completion::Keep,
            },
        }
    }
}

/// First `due + k * interval` (k >= 1) strictly after `now`, saturating
/// at `Micros::MAX`
pub(crate) fn next_deadline(due_us: Micros, interval_us: Micros, now_us: Micros) -> Micros {
    let interval = interval_us.max(1);
    let next = due_us.saturating_add(interval);
    if next > now_us || next == Micros::MAX {
        return next;
    }
    let missed = (now_us - due_us) / interval;
    due_us.saturating_add((missed + 1).saturating_mul(interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(kind: TimerKind, atomic: bool) -> TimerSlot {
        TimerSlot::new(kind, atomic, EvThread::current(), Box::new(|_| {}))
    }

    #[test]
    fn test_once_lifecycle() {
        let mut s = slot(TimerKind::Once, false);
        assert_eq!(s.state(), TimerState::Idle);

        s.arm(1000, 5000, 1);
        assert_eq!(s.state(), TimerState::Armed);
        assert!(s.is_armed_as(1));
        assert!(!s.is_armed_as(2));

        assert_eq!(s.fire(10), 5000);
        assert_eq!(s.state(), TimerState::Firing);
        assert_eq!(s.complete(5000, 5100), Completion::Keep);
        assert_eq!(s.state(), TimerState::Idle);
    }

    #[test]
    fn test_atomic_once_frees() {
        let mut s = slot(TimerKind::Once, true);
        s.arm(1000, 5000, 1);
        s.fire(10);
        assert_eq!(s.complete(5000, 5100), Completion::Free);
    }

    #[test]
    fn test_recurring_rearms_from_deadline() {
        let mut s = slot(TimerKind::Recurring, false);
        s.arm(1000, 5000, 1);
        s.fire(10);
        assert_eq!(s.complete(5000, 5300), Completion::Rearm(6000));
    }

    #[test]
    fn test_recurring_stopped_while_firing() {
        let mut s = slot(TimerKind::Recurring, false);
        s.arm(1000, 5000, 1);
        s.fire(10);
        assert!(!s.disarm());
        assert_eq!(s.complete(5000, 5300), Completion::Keep);
        assert_eq!(s.state(), TimerState::Idle);
    }

    #[test]
    fn test_destroy_during_fire_defers() {
        let mut s = slot(TimerKind::Recurring, false);
        s.arm(1000, 5000, 1);
        s.fire(10);
        assert_eq!(s.destroy(), Destroy::Deferred);
        assert_eq!(s.state(), TimerState::Removed);
        assert_eq!(s.complete(5000, 5100), Completion::Free);

        let mut idle = slot(TimerKind::Once, false);
        assert_eq!(idle.destroy(), Destroy::Free);
    }

    #[test]
    fn test_removed_waits_for_last_firing() {
        let mut s = slot(TimerKind::Once, false);
        s.arm(10, 100, 1);
        s.fire(10);
        s.arm(10, 200, 2);
        s.fire(10);
        assert_eq!(s.called, 2);
        assert_eq!(s.destroy(), Destroy::Deferred);
        assert_eq!(s.complete(100, 300), Completion::Keep);
        assert_eq!(s.complete(200, 300), Completion::Free);
    }

    #[test]
    #[should_panic(expected = "outstanding firings")]
    fn test_called_limit_is_fatal() {
        let mut s = slot(TimerKind::Once, false);
        for seq in 0..3 {
            s.arm(10, 100, seq);
            s.fire(2);
        }
    }

    #[test]
    fn test_next_deadline_skips_missed_periods() {
        assert_eq!(next_deadline(1000, 100, 1050), 1100);
        assert_eq!(next_deadline(1000, 100, 1100), 1200);
        assert_eq!(next_deadline(1000, 100, 1350), 1400);
    }

    #[test]
    fn test_next_deadline_saturates() {
        assert_eq!(next_deadline(Micros::MAX - 10, 100, 0), Micros::MAX);
        assert_eq!(next_deadline(1000, Micros::MAX, 2000), Micros::MAX);
        assert_eq!(next_deadline(0, 1 << 40, u64::MAX - 1), Micros::MAX);
    }
}
