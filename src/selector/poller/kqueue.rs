//! BSD `kqueue(2)` backend, woken through an `EVFILT_USER` event.

use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_USER,
    EVFILT_WRITE, NOTE_TRIGGER, kevent,
};
use parking_lot::Mutex;

use super::{PollEvent, Poller, WAKE_TOKEN, cvt, poller_error};
use crate::error::{self, Result};
use crate::operation::SocketOperation;

const MAX_EVENTS: usize = 256;
const WAKE_IDENT: usize = 1;

pub(crate) struct KqueuePoller {
    kqueue: RawFd,
    /// Filters currently installed per descriptor, to issue only the
    /// changes `kevent` accepts.
    installed: Mutex<std::collections::HashMap<RawFd, SocketOperation>>,
    buffer: Mutex<Vec<kevent>>,
}

// SAFETY: the raw `udata` pointers inside `kevent` only ever carry tokens.
unsafe impl Send for KqueuePoller {}
unsafe impl Sync for KqueuePoller {}

fn change(ident: usize, filter: i16, flags: u16, token: u64) -> kevent {
    kevent {
        ident,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as usize as *mut _,
    }
}

impl KqueuePoller {
    fn apply(&self, changes: &[kevent]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        // SAFETY: `changes` is a valid slice and no events are requested.
        let result = unsafe {
            libc::kevent(
                self.kqueue,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        cvt(result).map(drop).map_err(poller_error)
    }

    fn set_interest(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        let mut installed = self.installed.lock();
        let previous = installed.get(&fd).copied().unwrap_or_default();
        let mut changes = Vec::with_capacity(2);

        match (previous.wants_read(), interest.wants_read()) {
            (false, true) => changes.push(change(fd as usize, EVFILT_READ, EV_ADD | EV_ENABLE, token)),
            (true, false) => changes.push(change(fd as usize, EVFILT_READ, EV_DELETE, token)),
            _ => {}
        }
        match (previous.wants_write(), interest.wants_write()) {
            (false, true) => changes.push(change(fd as usize, EVFILT_WRITE, EV_ADD | EV_ENABLE, token)),
            (true, false) => changes.push(change(fd as usize, EVFILT_WRITE, EV_DELETE, token)),
            _ => {}
        }

        self.apply(&changes)?;
        installed.insert(fd, interest);
        Ok(())
    }
}

impl Poller for KqueuePoller {
    fn new() -> Result<Self> {
        // SAFETY: plain syscall, result checked.
        let kqueue = cvt(unsafe { libc::kqueue() }).map_err(poller_error)?;

        let poller = Self {
            kqueue,
            installed: Mutex::new(std::collections::HashMap::new()),
            buffer: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        poller.apply(&[change(
            WAKE_IDENT,
            EVFILT_USER,
            EV_ADD | EV_ENABLE | EV_CLEAR,
            WAKE_TOKEN,
        )])?;
        Ok(poller)
    }

    fn add(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.installed.lock().insert(fd, SocketOperation::NONE);
        self.set_interest(fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: SocketOperation) -> Result<()> {
        self.set_interest(fd, token, interest)
    }

    fn delete(&self, fd: RawFd) -> Result<()> {
        let previous = self.installed.lock().remove(&fd).unwrap_or_default();
        let mut changes = Vec::with_capacity(2);
        if previous.wants_read() {
            changes.push(change(fd as usize, EVFILT_READ, EV_DELETE, 0));
        }
        if previous.wants_write() {
            changes.push(change(fd as usize, EVFILT_WRITE, EV_DELETE, 0));
        }
        match self.apply(&changes) {
            Err(crate::error::TransportError::Socket { source })
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

        let spec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let spec_ptr = spec
            .as_ref()
            .map_or(ptr::null(), |spec| spec as *const libc::timespec);

        // SAFETY: the kernel writes at most `capacity` entries.
        let result = unsafe {
            libc::kevent(
                self.kqueue,
                ptr::null(),
                0,
                buffer.as_mut_ptr(),
                buffer.capacity() as libc::c_int,
                spec_ptr,
            )
        };
        let count = match cvt(result) {
            Ok(count) => count as usize,
            Err(e) if error::interrupted(&e) => return Ok(()),
            Err(e) => return Err(poller_error(e)),
        };
        // SAFETY: `count` entries were initialized by kevent.
        unsafe { buffer.set_len(count) };

        for event in buffer.iter() {
            if event.filter == EVFILT_USER {
                continue;
            }
            let token = event.udata as usize as u64;
            let mut ready = match event.filter {
                EVFILT_READ => SocketOperation::READ,
                EVFILT_WRITE => SocketOperation::WRITE,
                _ => continue,
            };
            if event.flags & (EV_EOF | EV_ERROR) != 0 {
                ready |= SocketOperation::READ | SocketOperation::WRITE;
            }

            // Read and write filters of one descriptor arrive separately.
            match events.iter_mut().find(|e| e.token == token) {
                Some(existing) => existing.ready |= ready,
                None => events.push(PollEvent { token, ready }),
            }
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let mut trigger = change(WAKE_IDENT, EVFILT_USER, 0, WAKE_TOKEN);
        trigger.fflags = NOTE_TRIGGER;
        self.apply(&[trigger])
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by this poller.
        unsafe { libc::close(self.kqueue) };
    }
}
