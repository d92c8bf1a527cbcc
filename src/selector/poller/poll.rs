//! Portable `poll(2)` backend, woken through a pipe.
//!
//! The descriptor set lives in user space; every change wakes a blocked
//! [`wait`](Poller::wait) so the next pass polls the updated set.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, pollfd};
use parking_lot::Mutex;

use super::{PollEvent, Poller, cvt, poller_error, timeout_millis};
use crate::error::{self, Result};
use crate::operation::SocketOperation;

pub(crate) struct PollPoller {
    registered: Mutex<HashMap<RawFd, (u64, SocketOperation)>>,
    wake_read: RawFd,
    wake_write: RawFd,
}

fn set_nonblocking_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let flags = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

fn poll_flags(interest: SocketOperation) -> libc::c_short {
    let mut flags = 0;
    if interest.wants_read() {
        flags |= POLLIN;
    }
    if interest.wants_write() {
        flags |= POLLOUT;
    }
    flags
}

impl PollPoller {
    fn drain_wake(&self) {
        let mut scratch = [0u8; 64];
        loop {
            // SAFETY: reads into a local buffer of the given length.
            let count = unsafe {
                libc::read(
                    self.wake_read,
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if count <= 0 {
                break;
            }
        }
    }
}

impl Poller for PollPoller {
    fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `fds` has room for the two descriptors.
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) }).map_err(poller_error)?;
        let [wake_read, wake_write] = fds;

        let poller = Self {
            registered: Mutex::new(HashMap::new()),
            wake_read,
            wake_write,
        };
        set_nonblocking_cloexec(wake_read).map_err(poller_error)?;
        set_nonblocking_cloexec(wake_write).map_err(poller_error)?;
        Ok(poller)
    }

    fn add(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.registered.lock().insert(fd, (token, interest));
        self.wake()
    }

    fn modify(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.add(fd, token, interest)
    }

    fn delete(&self, fd: RawFd) -> Result<()> {
        if self.registered.lock().remove(&fd).is_some() {
            self.wake()?;
        }
        Ok(())
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<()> {
        let mut fds = vec![pollfd {
            fd: self.wake_read,
            events: POLLIN,
            revents: 0,
        }];
        let mut tokens = vec![0u64];
        for (&fd, &(token, interest)) in self.registered.lock().iter() {
            if interest.is_none() {
                continue;
            }
            fds.push(pollfd {
                fd,
                events: poll_flags(interest),
                revents: 0,
            });
            tokens.push(token);
        }

        // SAFETY: `fds` is a valid array of `fds.len()` entries.
        let result = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        match cvt(result) {
            Ok(_) => {}
            Err(e) if error::interrupted(&e) => return Ok(()),
            Err(e) => return Err(poller_error(e)),
        }

        if fds[0].revents != 0 {
            self.drain_wake();
        }
        for (entry, &token) in fds.iter().zip(&tokens).skip(1) {
            let revents = entry.revents;
            if revents == 0 {
                continue;
            }
            let mut ready = SocketOperation::NONE;
            if revents & POLLIN != 0 {
                ready |= SocketOperation::READ;
            }
            if revents & POLLOUT != 0 {
                ready |= SocketOperation::WRITE;
            }
            if revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
                ready |= SocketOperation::READ | SocketOperation::WRITE;
            }
            events.push(PollEvent { token, ready });
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let byte = 1u8;
        // SAFETY: writes one byte from a local.
        let result = unsafe { libc::write(self.wake_write, (&byte as *const u8).cast(), 1) };
        if result < 0 {
            let e = std::io::Error::last_os_error();
            // A full pipe already guarantees a wakeup.
            if !error::would_block(&e) {
                return Err(poller_error(e));
            }
        }
        Ok(())
    }
}

impl Drop for PollPoller {
    fn drop(&mut self) {
        // SAFETY: both pipe ends are owned by this poller.
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_interrupts_wait() {
        let poller = PollPoller::new().unwrap();
        poller.wake().unwrap();
        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn reports_writable_pipe() {
        let poller = PollPoller::new().unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        poller.add(fds[1], 7, SocketOperation::WRITE).unwrap();
        let mut events = Vec::new();
        // The first pass may only consume the wakeup queued by `add`.
        for _ in 0..2 {
            poller
                .wait(&mut events, Some(Duration::from_secs(5)))
                .unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert_eq!(
            events,
            [PollEvent {
                token: 7,
                ready: SocketOperation::WRITE
            }]
        );

        poller.delete(fds[1]).unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
