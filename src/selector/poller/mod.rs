//! OS readiness backends.
//!
//! Each backend registers descriptors under a `u64` token, reports
//! level-triggered readiness and owns a wakeup channel that interrupts a
//! blocked [`Poller::wait`]. Token [`WAKE_TOKEN`] is reserved for that
//! channel and never reported.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod kqueue;
pub(crate) mod poll;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::operation::SocketOperation;

pub(crate) const WAKE_TOKEN: u64 = 0;

/// One readiness report. `ready` only ever holds `READ` and `WRITE`; a
/// hangup or error condition sets both so the handler observes it on its
/// next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollEvent {
    pub token: u64,
    pub ready: SocketOperation,
}

pub(crate) trait Poller: Send + Sync + Sized {
    fn new() -> Result<Self>;

    /// Starts watching `fd`. `interest` may be `NONE`.
    fn add(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()>;

    fn modify(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()>;

    /// Stops watching `fd`. A descriptor the OS already forgot (closed
    /// before deregistration) is not an error.
    fn delete(&self, fd: RawFd) -> Result<()>;

    /// Blocks until readiness, a wakeup or the timeout (`None` waits
    /// forever). Events are appended to `events`.
    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<()>;

    /// Interrupts a concurrent or the next [`wait`](Self::wait).
    fn wake(&self) -> Result<()>;
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "poll-backend")
))]
pub(crate) type Backend = epoll::EpollPoller;

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    not(feature = "poll-backend")
))]
pub(crate) type Backend = kqueue::KqueuePoller;

#[cfg(any(
    feature = "poll-backend",
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
pub(crate) type Backend = poll::PollPoller;

/// Milliseconds for the C wait calls; `-1` blocks.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            // Round up so a sub-millisecond timeout still waits.
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Converts a `-1` return of a libc call into an error.
pub(crate) fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

pub(crate) fn poller_error(error: io::Error) -> TransportError {
    TransportError::Socket { source: error }
}
