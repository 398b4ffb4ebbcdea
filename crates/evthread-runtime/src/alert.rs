//! Alert channel
//!
//! Type-keyed broadcast of observational conditions (currently thread
//! stalls detected by the timer engine). Listeners subscribe to one alert
//! type or to all of them. Raising snapshots the listener list and calls
//! each listener outside the lock, so a listener may itself register or
//! unregister.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, PoisonError};
use std::time::Duration;

use evthread_core::{kwarn, ThreadId};

/// Alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertType {
    /// A thread is not draining its queue: timer firings pile up
    ThreadStall,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ThreadStall => "THREAD_STALL",
        }
    }
}

/// Severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Typed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    ThreadStall {
        thread: String,
        thread_id: ThreadId,
        /// Estimated time the thread has been behind
        stall: Duration,
    },
}

/// A raised alert
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub reason: String,
    pub location: &'static Location<'static>,
}

impl Alert {
    #[track_caller]
    pub fn new(level: AlertLevel, kind: AlertKind, reason: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            reason: reason.into(),
            location: Location::caller(),
        }
    }

    pub fn alert_type(&self) -> AlertType {
        match self.kind {
            AlertKind::ThreadStall { .. } => AlertType::ThreadStall,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}: {} ({}:{})",
            self.alert_type().as_str(),
            self.level,
            self.reason,
            self.location.file(),
            self.location.line()
        )
    }
}

/// Which alerts a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Only(AlertType),
    All,
}

impl Subscription {
    #[inline]
    fn matches(&self, t: AlertType) -> bool {
        match self {
            Subscription::Only(want) => *want == t,
            Subscription::All => true,
        }
    }
}

/// Registration handle returned by `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Alert) + Send + Sync>;

/// Broadcast channel for alerts
pub struct AlertChannel {
    listeners: RwLock<Vec<(ListenerId, Subscription, Listener)>>,
    next_id: AtomicU64,
    raised: AtomicU64,
}

impl AlertChannel {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            raised: AtomicU64::new(0),
        }
    }

    /// Subscribe `f` to alerts matching `sub`
    pub fn register<F>(&self, sub: Subscription, f: F) -> ListenerId
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sub, Arc::new(f)));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver `alert` to every matching listener.
    ///
    /// Returns how many listeners were called.
    pub fn raise(&self, alert: Alert) -> usize {
        self.raised.fetch_add(1, Ordering::Relaxed);
        kwarn!("alert: {}", alert);

        let t = alert.alert_type();
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, sub, _)| sub.matches(t))
            .map(|(_, _, f)| Arc::clone(f))
            .collect();

        for f in &targets {
            f(&alert);
        }
        targets.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Alerts raised over the channel's lifetime
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }
}

impl Default for AlertChannel {
    fn default() -> Self {
        Self::new()
    }
}
