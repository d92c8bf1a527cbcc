//! Native descriptor wrapper shared between a handler and the selector.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Sentinel for "no descriptor".
pub const INVALID_FD: RawFd = -1;

/// Exposes the native descriptor of an event handler to the selector.
///
/// The descriptor and the selector token are atomics so a handler can be
/// shared (`Arc<dyn EventHandler>`) while the selector reads them from its
/// own thread.
#[derive(Debug)]
pub struct NativeInfo {
    fd: AtomicI32,
    token: AtomicU64,
}

impl NativeInfo {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            token: AtomicU64::new(0),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Replaces the descriptor.
    ///
    /// Reassigning the descriptor a handler already holds is accepted as a
    /// no-op. Assigning a different descriptor while one is set is a
    /// programming error caught in debug builds.
    pub fn set_fd(&self, fd: RawFd) {
        let current = self.fd.load(Ordering::Acquire);
        debug_assert!(
            current == INVALID_FD || fd == INVALID_FD || current == fd,
            "descriptor {current} replaced by {fd} while still set"
        );
        self.fd.store(fd, Ordering::Release);
    }

    pub fn clear_fd(&self) {
        self.fd.store(INVALID_FD, Ordering::Release);
    }

    pub(crate) fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: u64) {
        self.token.store(token, Ordering::Release);
    }
}

impl Default for NativeInfo {
    fn default() -> Self {
        Self::new(INVALID_FD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassigning_same_descriptor_is_tolerated() {
        let info = NativeInfo::new(7);
        info.set_fd(7);
        assert_eq!(info.fd(), 7);
        info.clear_fd();
        info.set_fd(9);
        assert_eq!(info.fd(), 9);
    }
}
