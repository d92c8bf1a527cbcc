//! Readiness multiplexing for transceivers and acceptors.
//!
//! A [`Selector`] watches the descriptors of registered [`EventHandler`]s
//! and hands ready `(handler, operations)` pairs to whoever drives it,
//! usually a pool of I/O threads:
//!
//! ```ignore
//! let mut ready = Vec::new();
//! loop {
//!     selector.start_select()?;
//!     selector.select(Some(Duration::from_secs(1)))?;
//!     selector.finish_select(&mut ready)?;
//!     for (handler, operations) in ready.drain(..) {
//!         // perform the I/O, then re-arm
//!         selector.enable(&handler, operations)?;
//!     }
//! }
//! ```
//!
//! Reported bits are disabled until re-armed, so each readiness change is
//! delivered to exactly one caller. [`EventSelector::finish`] removes a
//! handler even when an event for it was already collected by `select`.

pub mod completion;
pub(crate) mod poller;

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::network::native::{INVALID_FD, NativeInfo};
use crate::operation::SocketOperation;

use self::poller::{Backend, PollEvent, Poller, WAKE_TOKEN};

/// The unit of registration: anything exposing a native descriptor.
pub trait EventHandler: Send + Sync {
    fn native_info(&self) -> &NativeInfo;
}

/// Registration contract shared by the readiness and completion selectors.
pub trait EventSelector {
    /// Replaces `remove` with `add` in the handler's interest set. The
    /// first call registers the handler.
    fn update(
        &self,
        handler: &Arc<dyn EventHandler>,
        remove: SocketOperation,
        add: SocketOperation,
    ) -> Result<()>;

    /// Re-arms operations previously reported or disabled.
    fn enable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()>;

    fn disable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()>;

    /// Deregisters the handler. Returns whether its socket may be closed
    /// right away.
    fn finish(&self, handler: &Arc<dyn EventHandler>, close_now: bool) -> Result<bool>;

    /// Wakes a thread blocked in the selector.
    fn interrupt(&self) -> Result<()>;

    fn destroy(&self);
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    fd: RawFd,
    registered: SocketOperation,
    disabled: SocketOperation,
    ready_marks: SocketOperation,
    in_kernel: bool,
}

impl Registration {
    fn interest(&self) -> SocketOperation {
        self.registered & !self.disabled
    }
}

/// Maps interest onto the two bits a poller understands.
pub(crate) fn kernel_interest(interest: SocketOperation) -> SocketOperation {
    let mut kernel = SocketOperation::NONE;
    if interest.wants_read() {
        kernel |= SocketOperation::READ;
    }
    if interest.wants_write() {
        kernel |= SocketOperation::WRITE;
    }
    kernel
}

/// Translates a poller report back into the operations `interest` asked
/// for. A writable socket completes a pending connect.
pub(crate) fn reported(ready: SocketOperation, interest: SocketOperation) -> SocketOperation {
    let mut ops = SocketOperation::NONE;
    if ready.contains(SocketOperation::READ) {
        ops |= interest & SocketOperation::READ;
    }
    if ready.contains(SocketOperation::WRITE) {
        ops |= interest & (SocketOperation::WRITE | SocketOperation::CONNECT);
    }
    ops
}

pub(crate) fn handler_fd(handler: &Arc<dyn EventHandler>) -> Result<RawFd> {
    match handler.native_info().fd() {
        INVALID_FD => Err(TransportError::InvalidState(
            "cannot register a handler without a descriptor".to_string(),
        )),
        fd => Ok(fd),
    }
}

#[derive(Default)]
struct SelectorState {
    entries: HashMap<u64, Registration>,
}

/// Level-triggered readiness selector over the platform backend.
pub struct Selector {
    poller: Backend,
    state: Mutex<SelectorState>,
    events: Mutex<Vec<PollEvent>>,
    next_token: AtomicU64,
    destroyed: AtomicBool,
}

impl Selector {
    /// # Errors
    /// Returns [`TransportError::Socket`] if the OS refuses to create the
    /// poller or its wakeup channel.
    pub fn new() -> Result<Self> {
        Ok(Self {
            poller: Backend::new()?,
            state: Mutex::new(SelectorState::default()),
            events: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(WAKE_TOKEN + 1),
            destroyed: AtomicBool::new(false),
        })
    }

    fn check_destroyed(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(TransportError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Pushes the effective interest of `entry` to the kernel.
    fn sync(&self, token: u64, entry: &mut Registration) -> Result<()> {
        let interest = kernel_interest(entry.interest());
        if entry.in_kernel {
            self.poller.modify(entry.fd, token, interest)
        } else {
            self.poller.add(entry.fd, token, interest)?;
            entry.in_kernel = true;
            Ok(())
        }
    }

    /// Marks (or clears) operations as ready without OS readiness. Used by
    /// handlers that buffer data internally, such as a transceiver holding
    /// bytes it already pulled off the socket.
    pub fn ready(
        &self,
        handler: &Arc<dyn EventHandler>,
        op: SocketOperation,
        value: bool,
    ) -> Result<()> {
        self.check_destroyed()?;
        let wake = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&handler.native_info().token()) else {
                return Ok(());
            };
            if value {
                entry.ready_marks |= op;
            } else {
                entry.ready_marks = entry.ready_marks & !op;
            }
            value && entry.interest().intersects(op)
        };
        if wake {
            self.poller.wake()?;
        }
        Ok(())
    }

    /// Opens a polling pass.
    pub fn start_select(&self) -> Result<()> {
        self.check_destroyed()
    }

    /// Waits for readiness, a wakeup or `timeout` (`None` waits forever).
    /// Does not block when a handler carries ready marks. Returns the
    /// number of OS readiness events collected.
    pub fn select(&self, timeout: Option<Duration>) -> Result<usize> {
        self.check_destroyed()?;
        let marked = self
            .state
            .lock()
            .entries
            .values()
            .any(|entry| entry.ready_marks.intersects(entry.interest()));
        let timeout = if marked { Some(Duration::ZERO) } else { timeout };

        let mut events = self.events.lock();
        self.poller.wait(&mut events, timeout)?;
        Ok(events.len())
    }

    /// Closes the polling pass: fills `ready` with the handlers to service
    /// and disables the reported operations until they are re-enabled.
    pub fn finish_select(
        &self,
        ready: &mut Vec<(Arc<dyn EventHandler>, SocketOperation)>,
    ) -> Result<()> {
        ready.clear();
        self.check_destroyed()?;

        let events = std::mem::take(&mut *self.events.lock());
        let mut state = self.state.lock();

        let mut collected: Vec<(u64, SocketOperation)> = Vec::with_capacity(events.len());
        for event in &events {
            // Finished handlers are gone from the map.
            let Some(entry) = state.entries.get(&event.token) else {
                continue;
            };
            let ops = reported(event.ready, entry.interest());
            if !ops.is_none() {
                collected.push((event.token, ops));
            }
        }
        for (&token, entry) in &state.entries {
            let marked = entry.ready_marks & entry.interest();
            if marked.is_none() {
                continue;
            }
            match collected.iter_mut().find(|(t, _)| *t == token) {
                Some((_, ops)) => *ops |= marked,
                None => collected.push((token, marked)),
            }
        }

        for (token, ops) in collected {
            let Some(entry) = state.entries.get_mut(&token) else {
                continue;
            };
            entry.disabled |= ops;
            let handler = entry.handler.clone();
            // The handler's next I/O call reports a descriptor closed
            // before `finish`.
            if let Err(error) = self.sync(token, entry) {
                debug!(token, fd = entry.fd, %error, "cannot update readiness interest");
            }
            ready.push((handler, ops));
        }
        Ok(())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective interest of `handler`, `NONE` when unregistered.
    pub fn interest(&self, handler: &Arc<dyn EventHandler>) -> SocketOperation {
        self.state
            .lock()
            .entries
            .get(&handler.native_info().token())
            .map(Registration::interest)
            .unwrap_or_default()
    }
}

impl EventSelector for Selector {
    fn update(
        &self,
        handler: &Arc<dyn EventHandler>,
        remove: SocketOperation,
        add: SocketOperation,
    ) -> Result<()> {
        self.check_destroyed()?;
        let mut state = self.state.lock();

        let info = handler.native_info();
        let mut token = info.token();
        if token == WAKE_TOKEN || !state.entries.contains_key(&token) {
            let fd = handler_fd(handler)?;
            token = self.next_token.fetch_add(1, Ordering::Relaxed);
            info.set_token(token);
            state.entries.insert(
                token,
                Registration {
                    handler: handler.clone(),
                    fd,
                    registered: SocketOperation::NONE,
                    disabled: SocketOperation::NONE,
                    ready_marks: SocketOperation::NONE,
                    in_kernel: false,
                },
            );
            trace!(fd, token, "handler registered");
        }

        let Some(entry) = state.entries.get_mut(&token) else {
            return Ok(());
        };
        let previous = entry.interest();
        entry.registered = (entry.registered & !remove) | add;
        entry.disabled = entry.disabled & !add;
        if entry.in_kernel && previous == entry.interest() {
            return Ok(());
        }
        self.sync(token, entry)
    }

    fn enable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        let token = handler.native_info().token();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&token) else {
            return Ok(());
        };
        if !entry.disabled.intersects(op) {
            return Ok(());
        }
        entry.disabled = entry.disabled & !op;
        self.sync(token, entry)
    }

    fn disable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        let token = handler.native_info().token();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&token) else {
            return Ok(());
        };
        if entry.disabled.contains(op) {
            return Ok(());
        }
        entry.disabled |= op;
        self.sync(token, entry)
    }

    fn finish(&self, handler: &Arc<dyn EventHandler>, close_now: bool) -> Result<bool> {
        let info = handler.native_info();
        let removed = self.state.lock().entries.remove(&info.token());
        info.set_token(WAKE_TOKEN);

        if let Some(entry) = removed {
            trace!(fd = entry.fd, "handler finished");
            if entry.in_kernel && !self.destroyed.load(Ordering::Acquire) {
                self.poller.delete(entry.fd)?;
            }
        }
        Ok(close_now)
    }

    fn interrupt(&self) -> Result<()> {
        self.poller.wake()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut self.state.lock().entries);
        for (_, entry) in entries {
            entry.handler.native_info().set_token(WAKE_TOKEN);
            if entry.in_kernel {
                let _ = self.poller.delete(entry.fd);
            }
        }
        let _ = self.poller.wake();
        debug!("selector destroyed");
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("handlers", &self.len())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_is_reported_on_writable() {
        let interest = SocketOperation::CONNECT | SocketOperation::READ;
        assert_eq!(kernel_interest(interest), SocketOperation::READ | SocketOperation::WRITE);
        assert_eq!(
            reported(SocketOperation::WRITE, interest),
            SocketOperation::CONNECT
        );
        assert_eq!(
            reported(SocketOperation::READ | SocketOperation::WRITE, SocketOperation::READ),
            SocketOperation::READ
        );
    }
}
