//! Readiness backend
//!
//! `ReadinessBackend` is the seam between the dispatcher and the kernel
//! readiness mechanism. Linux uses epoll with an eventfd registered under
//! a reserved token so `wake()` can interrupt a blocking `wait()`.
//!
//! Errors are raw errno values.

use std::os::unix::io::RawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::io::interest::Interest;

/// One ready descriptor as reported by `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub events: Interest,
}

/// Kernel readiness mechanism
pub trait ReadinessBackend: Send + Sync {
    fn register(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), i32>;

    fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), i32>;

    /// Remove `fd`; a descriptor that is already gone is not an error
    fn unregister(&self, fd: RawFd) -> Result<(), i32>;

    /// Wait for readiness, appending to `out`. `None` waits forever.
    ///
    /// Returns early (possibly with nothing) after `wake()`.
    fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize, i32>;

    /// Interrupt a concurrent `wait()`
    fn wake(&self) -> Result<(), i32>;
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Create the platform backend
        pub fn new_backend(size_hint: usize, max_events: usize) -> Result<Box<dyn ReadinessBackend>, i32> {
            Ok(Box::new(EpollBackend::new(size_hint, max_events)?))
        }
    } else {
        compile_error!("the evthread I/O dispatcher requires epoll");
    }
}

/// Token reserved for the waker eventfd
const WAKE_TOKEN: u64 = u64::MAX;

/// epoll + eventfd waker
pub struct EpollBackend {
    epfd: RawFd,
    wakefd: RawFd,
    buf: Mutex<Vec<libc::epoll_event>>,
}

impl EpollBackend {
    pub fn new(size_hint: usize, max_events: usize) -> Result<Self, i32> {
        let epfd = unsafe { libc::epoll_create(size_hint.clamp(1, i32::MAX as usize) as i32) };
        if epfd < 0 {
            return Err(errno());
        }
        unsafe {
            libc::fcntl(epfd, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        let wakefd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakefd < 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
            }
            return Err(e);
        }

        let backend = Self {
            epfd,
            wakefd,
            buf: Mutex::new(vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)]),
        };
        backend.ctl(libc::EPOLL_CTL_ADD, wakefd, WAKE_TOKEN, Interest::READABLE)?;
        Ok(backend)
    }

    fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> Result<(), i32> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            Err(errno())
        } else {
            Ok(())
        }
    }

    fn drain_waker(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.wakefd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl ReadinessBackend for EpollBackend {
    fn register(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), i32> {
        debug_assert!(token != WAKE_TOKEN);
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn unregister(&self, fd: RawFd) -> Result<(), i32> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Interest::NONE) {
            Err(e) if e == libc::ENOENT || e == libc::EBADF => Ok(()),
            other => other,
        }
    }

    fn wait(&self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize, i32> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };

        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                buf.len().min(i32::MAX as usize) as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(errno());
        }

        let mut count = 0;
        for ev in &buf[..n as usize] {
            let token = ev.u64;
            if token == WAKE_TOKEN {
                self.drain_waker();
                continue;
            }
            out.push(Readiness {
                token,
                events: Interest::from_bits(ev.events),
            });
            count += 1;
        }
        Ok(count)
    }

    fn wake(&self) -> Result<(), i32> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wakefd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let e = errno();
            // Counter saturated: a wakeup is already pending
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakefd);
            libc::close(self.epfd);
        }
    }
}
