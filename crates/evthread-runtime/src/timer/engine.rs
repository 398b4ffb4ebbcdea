//! Engine state, timer handles and completion

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use evthread_core::clock::{duration_us, now_us};
use evthread_core::{kdebug, ktrace, Micros, RtError, RtResult, TimerId};

use crate::alert::{Alert, AlertChannel, AlertKind, AlertLevel};
use crate::config::RuntimeConfig;
use crate::thread::{EvThread, ThreadOptions};
use crate::timer::entry::{Completion, Destroy, Phase, TimerCallback, TimerKind, TimerSlot, TimerState};
use crate::timer::{worker, TimerConfig, TimerStats};

/// Shortest period of a recurring timer
const MIN_RECURRING_US: Micros = 1_000;

type HeapEntry = Reverse<(Micros, u64, TimerId)>;

/// A due timer, collected under the lock and posted after releasing it
pub(crate) struct Due {
    pub(crate) id: TimerId,
    pub(crate) due_us: Micros,
    pub(crate) target: EvThread,
    pub(crate) callback: Arc<Mutex<TimerCallback>>,
}

pub(crate) struct EngineState {
    heap: BinaryHeap<HeapEntry>,
    slots: HashMap<TimerId, TimerSlot>,
    /// Deadline the timer thread sleeps until
    pub(crate) next_wake_us: Micros,
    seq: u64,
    pub(crate) shutdown: bool,
    pub(crate) stats: TimerStats,
}

impl EngineState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_wake_us: Micros::MAX,
            seq: 0,
            shutdown: false,
            stats: TimerStats::default(),
        }
    }

    /// Arm `id` for `due_us`. Returns true if the wake deadline moved earlier.
    fn arm(&mut self, id: TimerId, interval_us: Micros, due_us: Micros) -> bool {
        self.seq += 1;
        let seq = self.seq;
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        slot.arm(interval_us, due_us, seq);
        self.heap.push(Reverse((due_us, seq, id)));
        self.stats.armed += 1;

        if due_us < self.next_wake_us {
            self.next_wake_us = due_us;
            true
        } else {
            false
        }
    }

    /// Earliest live deadline; drops stale heap entries on the way
    pub(crate) fn head_deadline(&mut self) -> Option<Micros> {
        while let Some(&Reverse((due_us, seq, id))) = self.heap.peek() {
            match self.slots.get(&id) {
                Some(slot) if slot.is_armed_as(seq) => return Some(due_us),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Move every timer due at `now` out of the pending set
    pub(crate) fn take_due(&mut self, now: Micros, config: &TimerConfig) -> (Vec<Due>, Vec<Alert>) {
        let mut due = Vec::new();
        let mut alerts = Vec::new();

        while let Some(&Reverse((at, seq, id))) = self.heap.peek() {
            if at > now {
                break;
            }
            self.heap.pop();

            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if !slot.is_armed_as(seq) {
                continue;
            }

            let due_us = slot.fire(config.called_limit);
            if slot.called % config.stall_threshold == 0 {
                alerts.push(stall_alert(id, slot));
            }
            due.push(Due {
                id,
                due_us,
                target: slot.target.clone(),
                callback: Arc::clone(&slot.callback),
            });
        }

        self.stats.fired += due.len() as u64;
        self.stats.stalls += alerts.len() as u64;
        (due, alerts)
    }
}

fn stall_alert(id: TimerId, slot: &TimerSlot) -> Alert {
    let stall = Duration::from_micros(slot.interval_us.max(1).saturating_mul(slot.called as u64));
    Alert::new(
        AlertLevel::Warning,
        AlertKind::ThreadStall {
            thread: slot.target.name().to_string(),
            thread_id: slot.target.id(),
            stall,
        },
        format!(
            "thread '{}' has {} outstanding firings of timer {} (~{:?} behind)",
            slot.target.name(),
            slot.called,
            id,
            stall
        ),
    )
}

pub(crate) struct Shared {
    state: Mutex<EngineState>,
    pub(crate) cond: Condvar,
    pub(crate) config: TimerConfig,
    pub(crate) alerts: Arc<AlertChannel>,
    thread: Mutex<Option<EvThread>>,
}

impl Shared {
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A firing finished (or was dropped unrun) on the target thread
    fn complete(&self, id: TimerId, due_us: Micros) {
        let mut st = self.lock();
        st.stats.completed += 1;

        let Some(slot) = st.slots.get_mut(&id) else {
            return;
        };
        match slot.complete(due_us, now_us()) {
            Completion::Keep => {}
            Completion::Rearm(next_us) => {
                let interval_us = slot.interval_us;
                if st.arm(id, interval_us, next_us) {
                    self.cond.notify_one();
                }
            }
            Completion::Free => {
                let freed = st.slots.remove(&id);
                st.stats.freed += 1;
                drop(st);
                ktrace!("timer {} freed after completion", id);
                drop(freed);
            }
        }
    }

    /// Post a due timer's callback onto its target thread
    pub(crate) fn post_firing(self: &Arc<Self>, due: Due) {
        let firing = Firing {
            shared: Arc::clone(self),
            id: due.id,
            due_us: due.due_us,
        };
        let timer = Timer {
            id: due.id,
            shared: Arc::clone(self),
        };
        let callback = due.callback;

        let posted = due.target.post(move || {
            let _done = firing;
            let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (&mut **cb)(&timer);
        });
        if !posted {
            kdebug!(
                "timer {}: target '{}' has exited, firing dropped",
                due.id,
                due.target.name()
            );
        }
    }
}

/// Outstanding firing; completes when dropped, whether or not it ran
struct Firing {
    shared: Arc<Shared>,
    id: TimerId,
    due_us: Micros,
}

impl Drop for Firing {
    fn drop(&mut self) {
        self.shared.complete(self.id, self.due_us);
    }
}

fn effective_interval(kind: TimerKind, interval: Duration) -> Micros {
    let us = duration_us(interval);
    match kind {
        TimerKind::Recurring => us.max(MIN_RECURRING_US),
        TimerKind::Once => us,
    }
}

// ============================================================================
// Timer handle
// ============================================================================

/// Handle to a timer created with `TimerEngine::create`.
///
/// Clones refer to the same timer. Dropping a handle does not destroy the
/// timer; call `destroy()`.
#[derive(Clone)]
pub struct Timer {
    id: TimerId,
    shared: Arc<Shared>,
}

impl Timer {
    #[inline]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Arm the timer to fire after `interval` (and every `interval` for
    /// recurring timers). An armed timer is implicitly stopped first.
    pub fn start(&self, interval: Duration) -> RtResult<()> {
        let mut st = self.shared.lock();
        if st.shutdown {
            return Err(RtError::ShutDown);
        }
        let kind = match st.slots.get(&self.id) {
            Some(slot) if slot.phase != Phase::Removed => slot.kind,
            _ => return Err(RtError::TimerFreed),
        };

        let interval_us = effective_interval(kind, interval);
        if st.arm(self.id, interval_us, now_us().saturating_add(interval_us)) {
            self.shared.cond.notify_one();
        }
        Ok(())
    }

    /// Remove the timer from the pending set. No-op if not armed.
    ///
    /// A firing already queued still runs; a recurring timer stopped
    /// during its callback is not re-armed.
    pub fn stop(&self) {
        let mut st = self.shared.lock();
        if let Some(slot) = st.slots.get_mut(&self.id) {
            slot.disarm();
        }
    }

    /// Stop and free the timer.
    ///
    /// With a firing in flight (including from the timer's own callback)
    /// the timer becomes REMOVED and is freed by the last completion.
    /// Destroying twice is harmless.
    pub fn destroy(&self) {
        let mut st = self.shared.lock();
        let Some(slot) = st.slots.get_mut(&self.id) else {
            return;
        };
        match slot.destroy() {
            Destroy::Deferred => {
                ktrace!("timer {} destroy deferred ({} in flight)", self.id, slot.called);
            }
            Destroy::Free => {
                let freed = st.slots.remove(&self.id);
                st.stats.freed += 1;
                drop(st);
                drop(freed);
            }
        }
    }

    /// Time until the next firing; `None` when not armed
    pub fn next(&self) -> Option<Duration> {
        let st = self.shared.lock();
        let due_us = st.slots.get(&self.id)?.due_us()?;
        Some(Duration::from_micros(due_us.saturating_sub(now_us())))
    }

    pub fn state(&self) -> TimerState {
        self.shared
            .lock()
            .slots
            .get(&self.id)
            .map_or(TimerState::Freed, TimerSlot::state)
    }

    /// Firings queued or executing
    pub fn in_flight(&self) -> u32 {
        self.shared.lock().slots.get(&self.id).map_or(0, |s| s.called)
    }

    pub fn kind(&self) -> Option<TimerKind> {
        self.shared.lock().slots.get(&self.id).map(|s| s.kind)
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Deadline scheduler plus its firing thread
#[derive(Clone)]
pub struct TimerEngine {
    shared: Arc<Shared>,
}

impl TimerEngine {
    pub fn new(config: TimerConfig, alerts: Arc<AlertChannel>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new()),
                cond: Condvar::new(),
                config,
                alerts,
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &RuntimeConfig, alerts: Arc<AlertChannel>) -> Self {
        Self::new(TimerConfig::from(config), alerts)
    }

    /// Start the timer thread; idempotent
    pub fn start(&self) -> RtResult<()> {
        let mut thread = self.shared.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Ok(());
        }
        if self.shared.lock().shutdown {
            return Err(RtError::ShutDown);
        }

        let shared = Arc::clone(&self.shared);
        let opts = ThreadOptions::service(self.shared.config.poll_interval);
        *thread = Some(EvThread::spawn_with("timers", opts, move |_| {
            worker::run(shared)
        })?);
        Ok(())
    }

    /// Create an idle timer whose callback runs on `target`
    pub fn create<F>(&self, kind: TimerKind, target: &EvThread, callback: F) -> RtResult<Timer>
    where
        F: FnMut(&Timer) + Send + 'static,
    {
        self.start()?;
        let id = self.insert(kind, false, target, Box::new(callback))?;
        Ok(Timer {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Create and start an engine-owned timer.
    ///
    /// A ONCE timer is freed after it fires. A RECURRING timer lives until
    /// its callback destroys it through the `&Timer` it receives, or until
    /// the engine shuts down.
    pub fn add<F>(&self, kind: TimerKind, interval: Duration, target: &EvThread, callback: F) -> RtResult<TimerId>
    where
        F: FnMut(&Timer) + Send + 'static,
    {
        self.start()?;
        let id = self.insert(kind, true, target, Box::new(callback))?;
        let interval_us = effective_interval(kind, interval);

        let mut st = self.shared.lock();
        if st.arm(id, interval_us, now_us().saturating_add(interval_us)) {
            self.shared.cond.notify_one();
        }
        Ok(id)
    }

    fn insert(&self, kind: TimerKind, atomic: bool, target: &EvThread, callback: TimerCallback) -> RtResult<TimerId> {
        let id = TimerId::next();
        let mut st = self.shared.lock();
        if st.shutdown {
            return Err(RtError::ShutDown);
        }
        st.slots.insert(id, TimerSlot::new(kind, atomic, target.clone(), callback));
        st.stats.created += 1;
        Ok(id)
    }

    /// Handle for an existing timer (e.g. one returned by `add`)
    pub fn timer(&self, id: TimerId) -> Option<Timer> {
        self.shared.lock().slots.contains_key(&id).then(|| Timer {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the timer thread and free every timer.
    ///
    /// Firings already posted still run; their completions find nothing.
    pub fn shutdown(&self) {
        let slots = {
            let mut st = self.shared.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            st.heap.clear();
            std::mem::take(&mut st.slots)
        };
        self.shared.cond.notify_all();
        kdebug!("timer engine shutting down ({} timers freed)", slots.len());
        drop(slots);

        let thread = self.shared.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(t) = thread {
            t.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, EvThread::is_running)
    }

    /// Live timers
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timers currently in the pending set
    pub fn armed(&self) -> usize {
        self.shared
            .lock()
            .slots
            .values()
            .filter(|s| s.state() == TimerState::Armed)
            .count()
    }

    pub fn stats(&self) -> TimerStats {
        self.shared.lock().stats.clone()
    }

    pub fn alerts(&self) -> &Arc<AlertChannel> {
        &self.shared.alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertType, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn engine() -> TimerEngine {
        let config = TimerConfig {
            idle_sleep: Duration::from_secs(3600),
            stall_threshold: 10,
            called_limit: 10_000,
            poll_interval: Duration::from_millis(50),
        };
        TimerEngine::new(config, Arc::new(AlertChannel::new()))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_once_fires_once_not_early() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-once").unwrap();
        let (tx, rx) = mpsc::channel();

        let started = Instant::now();
        let timer = eng
            .create(TimerKind::Once, &target, move |_| {
                tx.send(Instant::now()).unwrap();
            })
            .unwrap();
        timer.start(Duration::from_millis(50)).unwrap();
        assert_eq!(timer.state(), TimerState::Armed);

        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(started) >= Duration::from_millis(50));
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        assert!(wait_until(Duration::from_secs(1), || timer.state() == TimerState::Idle));
        assert_eq!(timer.next(), None);

        timer.destroy();
        assert_eq!(timer.state(), TimerState::Freed);
        timer.destroy();
        assert_eq!(timer.start(Duration::from_millis(1)), Err(RtError::TimerFreed));

        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_atomic_once_is_freed() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-atomic").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let id = eng
            .add(TimerKind::Once, Duration::from_millis(20), &target, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(eng.timer(id).is_some());

        assert!(wait_until(Duration::from_secs(5), || eng.is_empty()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(eng.timer(id).is_none());

        let stats = eng.stats();
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.freed, 1);

        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_recurring_until_stopped() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-recur").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let timer = eng
            .create(TimerKind::Recurring, &target, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        timer.start(Duration::from_millis(20)).unwrap();

        std::thread::sleep(Duration::from_millis(250));
        timer.stop();
        let at_stop = hits.load(Ordering::SeqCst);
        assert!((4..=14).contains(&at_stop), "fired {} times", at_stop);

        // At most one in-flight firing after stop
        std::thread::sleep(Duration::from_millis(100));
        assert!(hits.load(Ordering::SeqCst) <= at_stop + 1);
        assert_eq!(timer.state(), TimerState::Idle);

        timer.destroy();
        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_destroy_from_own_callback() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-destroy").unwrap();
        let (tx, rx) = mpsc::channel();

        let timer = eng
            .create(TimerKind::Recurring, &target, move |t| {
                t.destroy();
                tx.send(t.state()).unwrap();
            })
            .unwrap();
        timer.start(Duration::from_millis(10)).unwrap();

        let inside = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inside, TimerState::Removed);
        assert!(wait_until(Duration::from_secs(1), || timer.state() == TimerState::Freed));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_restart_moves_deadline() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-restart").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let timer = eng
            .create(TimerKind::Once, &target, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        timer.start(Duration::from_secs(60)).unwrap();
        let remaining = timer.next().unwrap();
        assert!(remaining > Duration::from_secs(59));

        timer.start(Duration::from_millis(20)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Stopping an unarmed timer is a no-op
        timer.stop();
        assert_eq!(timer.next(), None);

        timer.destroy();
        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_huge_interval_never_fires() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-huge").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let timer = eng
            .create(TimerKind::Recurring, &target, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        timer.start(Duration::MAX).unwrap();
        assert_eq!(timer.state(), TimerState::Armed);
        assert!(timer.next().unwrap() > Duration::from_secs(365 * 24 * 3600));

        let h = Arc::clone(&hits);
        let id = eng
            .add(TimerKind::Once, Duration::from_secs(u64::MAX), &target, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(eng.armed(), 2);

        timer.destroy();
        if let Some(t) = eng.timer(id) {
            t.destroy();
        }
        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_stall_alert_on_backlog() {
        let config = TimerConfig {
            idle_sleep: Duration::from_secs(3600),
            stall_threshold: 3,
            called_limit: 100,
            poll_interval: Duration::from_millis(50),
        };
        let alerts = Arc::new(AlertChannel::new());
        let stalls = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&stalls);
        alerts.register(Subscription::Only(AlertType::ThreadStall), move |a| {
            s.lock().unwrap().push(a.kind.clone());
        });
        let eng = TimerEngine::new(config, alerts);

        // Target does not drain its queue until released
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let target = EvThread::spawn("t-stalled", move |me| {
            let _ = release_rx.recv();
            me.dispatch();
        })
        .unwrap();

        let timer = eng.create(TimerKind::Once, &target, |_| {}).unwrap();
        for i in 1..=6u32 {
            timer.start(Duration::from_millis(1)).unwrap();
            assert!(wait_until(Duration::from_secs(5), || timer.in_flight() == i));
        }

        // Alerts are raised after the lock is released
        assert!(wait_until(Duration::from_secs(5), || stalls.lock().unwrap().len() == 2));
        {
            let got = stalls.lock().unwrap();
            match &got[0] {
                AlertKind::ThreadStall { thread, thread_id, .. } => {
                    assert_eq!(thread, "t-stalled");
                    assert_eq!(*thread_id, target.id());
                }
            }
        }
        assert_eq!(eng.stats().stalls, 2);

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || timer.in_flight() == 0));
        assert_eq!(timer.state(), TimerState::Idle);

        timer.destroy();
        eng.shutdown();
        target.kill_join();
    }

    #[test]
    fn test_firing_to_exited_thread_completes() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-gone").unwrap();
        target.kill_join();

        eng.add(TimerKind::Once, Duration::from_millis(5), &target, |_| {
            panic!("must not run on an exited thread");
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || eng.is_empty()));

        eng.shutdown();
    }

    #[test]
    fn test_shutdown_refuses_new_timers() {
        let eng = engine();
        let target = EvThread::spawn_dispatcher("t-shut").unwrap();
        let timer = eng.create(TimerKind::Once, &target, |_| {}).unwrap();
        timer.start(Duration::from_secs(10)).unwrap();
        assert!(eng.is_running());

        eng.shutdown();
        assert!(!eng.is_running());
        assert_eq!(timer.state(), TimerState::Freed);
        assert_eq!(timer.start(Duration::from_millis(1)), Err(RtError::ShutDown));
        assert!(matches!(
            eng.create(TimerKind::Once, &target, |_| {}),
            Err(RtError::ShutDown)
        ));
        eng.shutdown();
        target.kill_join();
    }
}
