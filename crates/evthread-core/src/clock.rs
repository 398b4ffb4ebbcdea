//! Monotonic microsecond clock
//!
//! All deadlines in the runtime are absolute microsecond counts since a
//! process-wide epoch captured on first use. Being based on `Instant`,
//! the clock never goes backwards.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Absolute timestamp in microseconds since the process epoch
pub type Micros = u64;

static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Current monotonic time in microseconds
#[inline]
pub fn now_us() -> Micros {
    epoch().elapsed().as_micros() as Micros
}

/// Convert an absolute timestamp back to an `Instant`
#[inline]
pub fn to_instant(ts: Micros) -> Instant {
    epoch() + Duration::from_micros(ts)
}

/// Duration from now until `ts` (zero if already passed)
#[inline]
pub fn until(ts: Micros) -> Duration {
    Duration::from_micros(ts.saturating_sub(now_us()))
}

/// Saturating conversion of a duration to microseconds
#[inline]
pub fn duration_us(d: Duration) -> Micros {
    d.as_micros().min(u64::MAX as u128) as Micros
}
