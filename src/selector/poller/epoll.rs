//! Linux `epoll(7)` backend, woken through an `eventfd(2)`.

use std::os::fd::RawFd;
use std::time::Duration;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event,
};
use parking_lot::Mutex;

use super::{PollEvent, Poller, WAKE_TOKEN, cvt, poller_error, timeout_millis};
use crate::error::{self, Result, TransportError};
use crate::operation::SocketOperation;

const MAX_EVENTS: usize = 256;

pub(crate) struct EpollPoller {
    epoll: RawFd,
    wake: RawFd,
    buffer: Mutex<Vec<epoll_event>>,
}

impl EpollPoller {
    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        let mut event = epoll_event {
            events: interest_flags(interest),
            u64: token,
        };
        // SAFETY: `event` outlives the call and `self.epoll` is open.
        cvt(unsafe { libc::epoll_ctl(self.epoll, op, fd, &mut event) })
            .map(drop)
            .map_err(poller_error)
    }

    fn drain_wake(&self) {
        let mut value: u64 = 0;
        // SAFETY: reads exactly 8 bytes into `value`.
        unsafe {
            libc::read(
                self.wake,
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

fn interest_flags(interest: SocketOperation) -> u32 {
    let mut flags = 0;
    if interest.wants_read() {
        flags |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.wants_write() {
        flags |= EPOLLOUT;
    }
    flags as u32
}

impl Poller for EpollPoller {
    fn new() -> Result<Self> {
        // SAFETY: plain syscalls, results checked.
        let epoll = cvt(unsafe { libc::epoll_create1(EPOLL_CLOEXEC) }).map_err(poller_error)?;
        let wake = match cvt(unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) }) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(epoll) };
                return Err(poller_error(e));
            }
        };

        let poller = Self {
            epoll,
            wake,
            buffer: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        poller.ctl(EPOLL_CTL_ADD, wake, WAKE_TOKEN, SocketOperation::READ)?;
        Ok(poller)
    }

    fn add(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    fn delete(&self, fd: RawFd) -> Result<()> {
        match self.ctl(EPOLL_CTL_DEL, fd, 0, SocketOperation::NONE) {
            Err(TransportError::Socket { source })
                if matches!(source.raw_os_error(), Some(libc::EBADF | libc::ENOENT)) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn wait(&self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<()> {
        let mut buffer = self.buffer.lock();
        buffer.clear();

        let count = loop {
            // SAFETY: the kernel writes at most `capacity` entries into the
            // spare capacity of `buffer`.
            let result = unsafe {
                libc::epoll_wait(
                    self.epoll,
                    buffer.as_mut_ptr(),
                    buffer.capacity() as libc::c_int,
                    timeout_millis(timeout),
                )
            };
            match cvt(result) {
                Ok(count) => break count as usize,
                Err(e) if error::interrupted(&e) => return Ok(()),
                Err(e) => return Err(poller_error(e)),
            }
        };
        // SAFETY: `count` entries were initialized by epoll_wait.
        unsafe { buffer.set_len(count) };

        for event in buffer.iter() {
            let token = event.u64;
            let flags = event.events as libc::c_int;
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }

            let mut ready = SocketOperation::NONE;
            if flags & (EPOLLIN | EPOLLRDHUP) != 0 {
                ready |= SocketOperation::READ;
            }
            if flags & EPOLLOUT != 0 {
                ready |= SocketOperation::WRITE;
            }
            if flags & (EPOLLERR | EPOLLHUP) != 0 {
                ready |= SocketOperation::READ | SocketOperation::WRITE;
            }
            events.push(PollEvent { token, ready });
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let value: u64 = 1;
        // SAFETY: writes exactly 8 bytes from `value`.
        let result = unsafe {
            libc::write(
                self.wake,
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if result < 0 {
            let e = std::io::Error::last_os_error();
            // A saturated counter still wakes the waiter.
            if !error::would_block(&e) {
                return Err(poller_error(e));
            }
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this poller.
        unsafe {
            libc::close(self.wake);
            libc::close(self.epoll);
        }
    }
}
