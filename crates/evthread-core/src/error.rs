//! Error types for the evthread runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtError {
    /// OS thread could not be spawned
    SpawnFailed(SpawnError),

    /// Bulk creation asked for too many threads
    TooManyThreads(usize),

    /// Readiness mechanism (epoll) could not be created
    PollerCreate(i32),

    /// Descriptor registration with the readiness mechanism failed
    Register {
        fd: i32,
        errno: i32,
    },

    /// Descriptor is not a valid file descriptor
    InvalidFd(i32),

    /// Operation requires a running thread but the target has exited
    ThreadExited,

    /// Subsystem has been shut down
    ShutDown,

    /// Timer was destroyed
    TimerFreed,

    /// Runtime not initialized
    NotInitialized,

    /// Runtime already initialized
    AlreadyInitialized,

    /// Invalid configuration
    Config(String),

    /// Platform-specific error
    PlatformError(i32),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::SpawnFailed(e) => write!(f, "spawn failed: {}", e),
            RtError::TooManyThreads(n) => write!(f, "too many threads requested: {}", n),
            RtError::PollerCreate(errno) => write!(f, "poller creation failed: errno {}", errno),
            RtError::Register { fd, errno } => {
                write!(f, "registration of fd {} failed: errno {}", fd, errno)
            }
            RtError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
            RtError::ThreadExited => write!(f, "target thread has exited"),
            RtError::ShutDown => write!(f, "subsystem shut down"),
            RtError::TimerFreed => write!(f, "timer destroyed"),
            RtError::NotInitialized => write!(f, "runtime not initialized"),
            RtError::AlreadyInitialized => write!(f, "runtime already initialized"),
            RtError::Config(msg) => write!(f, "invalid config: {}", msg),
            RtError::PlatformError(code) => write!(f, "platform error: {}", code),
        }
    }
}

impl std::error::Error for RtError {}

/// Thread spawn failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnError {
    /// Name of the thread that failed to start
    pub name: String,
    /// OS error code, if the OS reported one
    pub errno: Option<i32>,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "thread '{}' (errno {})", self.name, errno),
            None => write!(f, "thread '{}'", self.name),
        }
    }
}

impl From<SpawnError> for RtError {
    fn from(e: SpawnError) -> Self {
        RtError::SpawnFailed(e)
    }
}

impl From<std::io::Error> for RtError {
    fn from(e: std::io::Error) -> Self {
        // EIO when the error did not come from the OS
        RtError::PlatformError(e.raw_os_error().unwrap_or(5))
    }
}

impl RtError {
    /// Build a spawn error from the `io::Error` returned by `thread::Builder::spawn`
    pub fn spawn(name: &str, err: &std::io::Error) -> Self {
        RtError::SpawnFailed(SpawnError {
            name: name.to_string(),
            errno: err.raw_os_error(),
        })
    }

    /// OS error code carried by this error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            RtError::SpawnFailed(e) => e.errno,
            RtError::PollerCreate(errno)
            | RtError::Register { errno, .. }
            | RtError::PlatformError(errno) => Some(*errno),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RtError::Register { fd: 5, errno: 9 };
        assert_eq!(format!("{}", e), "registration of fd 5 failed: errno 9");

        let e = RtError::SpawnFailed(SpawnError {
            name: "io:3".into(),
            errno: Some(11),
        });
        assert_eq!(format!("{}", e), "spawn failed: thread 'io:3' (errno 11)");
    }

    #[test]
    fn test_errno_extraction() {
        let io = std::io::Error::from_raw_os_error(11);
        let e = RtError::spawn("worker0", &io);
        assert_eq!(e.errno(), Some(11));
        assert_eq!(RtError::ShutDown.errno(), None);

        let e: RtError = std::io::Error::from_raw_os_error(24).into();
        assert_eq!(e, RtError::PlatformError(24));
        assert_eq!(RtError::PollerCreate(24).errno(), Some(24));
    }
}
