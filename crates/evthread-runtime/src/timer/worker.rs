//! Timer thread
//!
//! Loop, under the engine lock:
//! 1. Move every due timer out of the pending set (`called += 1`)
//! 2. Release the lock, raise stall alerts and post one firing per timer
//!    onto its target thread
//! 3. Recompute the wake deadline (head of the heap, or the idle sleep)
//!    and wait on the condvar until it passes or an earlier timer is armed

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use evthread_core::clock::{duration_us, now_us};
use evthread_core::{kdebug, kinfo};

use crate::timer::engine::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    kinfo!("timer thread started");
    let idle_us = duration_us(shared.config.idle_sleep);

    let mut st = shared.lock();
    while !st.shutdown {
        let now = now_us();
        let (due, stalls) = st.take_due(now, &shared.config);

        if !due.is_empty() {
            // Busy: arms made while posting need not signal
            st.next_wake_us = 0;
            drop(st);

            for alert in stalls {
                shared.alerts.raise(alert);
            }
            for d in due {
                shared.post_firing(d);
            }

            st = shared.lock();
            continue;
        }

        let next = st.head_deadline().unwrap_or_else(|| now.saturating_add(idle_us));
        st.next_wake_us = next;
        let wait = Duration::from_micros(next.saturating_sub(now));
        st = shared
            .cond
            .wait_timeout(st, wait)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
    drop(st);
    kdebug!("timer thread stopped");
}
