//! Completion-model selector.
//!
//! Where the readiness [`Selector`](super::Selector) reports "this socket
//! can be read", a completion selector reports "the read you started has
//! completed". Every operation goes through an explicit pair:
//! [`start_async`](CompletionSelector::start_async) before the I/O and
//! [`finish_async`](CompletionSelector::finish_async) after the handler
//! was returned by [`get_next_handler`](CompletionSelector::get_next_handler).
//!
//! Completions are produced from the platform readiness backend: an armed
//! operation completes the first time its descriptor is reported ready,
//! and is then disarmed until started again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::poller::{Backend, PollEvent, Poller, WAKE_TOKEN};
use super::{EventHandler, EventSelector, handler_fd, kernel_interest, reported};
use crate::error::{Result, TransportError};
use crate::operation::SocketOperation;

struct Registration {
    handler: Arc<dyn EventHandler>,
    fd: RawFd,
    registered: SocketOperation,
    disabled: SocketOperation,
    /// Started and not yet finished.
    pending: SocketOperation,
    /// Started and waiting for the OS.
    armed: SocketOperation,
    in_kernel: bool,
}

#[derive(Default)]
struct CompletionState {
    entries: HashMap<u64, Registration>,
    completions: VecDeque<(u64, SocketOperation)>,
}

impl CompletionState {
    fn post(&mut self, token: u64, op: SocketOperation) {
        match self.completions.iter_mut().find(|(t, _)| *t == token) {
            Some((_, ops)) => *ops |= op,
            None => self.completions.push_back((token, op)),
        }
    }
}

pub struct CompletionSelector {
    poller: Backend,
    state: Mutex<CompletionState>,
    events: Mutex<Vec<PollEvent>>,
    next_token: AtomicU64,
    destroyed: AtomicBool,
}

impl CompletionSelector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poller: Backend::new()?,
            state: Mutex::new(CompletionState::default()),
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

    fn arm(&self, token: u64, entry: &mut Registration) -> Result<()> {
        let interest = kernel_interest(entry.armed);
        if entry.in_kernel {
            self.poller.modify(entry.fd, token, interest)
        } else {
            self.poller.add(entry.fd, token, interest)?;
            entry.in_kernel = true;
            Ok(())
        }
    }

    /// Starts an asynchronous `op` on `handler`. Its completion is returned
    /// by a later [`get_next_handler`](Self::get_next_handler).
    ///
    /// # Errors
    /// [`TransportError::InvalidState`] if the handler is not registered
    /// or `op` is already pending.
    pub fn start_async(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        let token = handler.native_info().token();
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&token).ok_or_else(|| {
            TransportError::InvalidState("asynchronous operation on an unregistered handler".into())
        })?;
        if entry.pending.intersects(op) {
            return Err(TransportError::InvalidState(format!(
                "{op:?} already pending"
            )));
        }
        entry.pending |= op;
        entry.armed |= op;
        self.arm(token, entry)
    }

    /// Acknowledges the completion of `op`.
    ///
    /// # Errors
    /// [`TransportError::InvalidState`] if `op` was not pending.
    pub fn finish_async(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        let token = handler.native_info().token();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&token) else {
            return Err(TransportError::InvalidState(
                "finishing an operation of an unregistered handler".into(),
            ));
        };
        if !entry.pending.contains(op) {
            return Err(TransportError::InvalidState(format!("{op:?} is not pending")));
        }
        entry.pending = entry.pending & !op;
        Ok(())
    }

    /// Posts a completion for `op` without OS involvement.
    pub fn completed(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        let token = handler.native_info().token();
        {
            let mut state = self.state.lock();
            if !state.entries.contains_key(&token) {
                return Ok(());
            }
            state.post(token, op);
        }
        self.poller.wake()
    }

    /// Returns the next completed `(handler, operations)` pair, waiting up
    /// to `timeout` for one. `Ok(None)` means the wait timed out or was
    /// interrupted.
    pub fn get_next_handler(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<(Arc<dyn EventHandler>, SocketOperation)>> {
        self.check_destroyed()?;
        if let Some(next) = self.pop() {
            return Ok(Some(next));
        }

        let mut events = self.events.lock();
        // A completion may have been posted while waiting for the lock.
        if let Some(next) = self.pop() {
            return Ok(Some(next));
        }
        events.clear();
        self.poller.wait(&mut events, timeout)?;

        let mut state = self.state.lock();
        for event in events.drain(..) {
            let Some(entry) = state.entries.get_mut(&event.token) else {
                continue;
            };
            let ops = reported(event.ready, entry.armed);
            if ops.is_none() {
                continue;
            }
            entry.armed = entry.armed & !ops;
            if let Err(error) = self.arm(event.token, entry) {
                debug!(token = event.token, fd = entry.fd, %error, "cannot update completion interest");
            }
            state.post(event.token, ops);
        }
        drop(state);
        drop(events);
        Ok(self.pop())
    }

    fn pop(&self) -> Option<(Arc<dyn EventHandler>, SocketOperation)> {
        let mut state = self.state.lock();
        while let Some((token, ops)) = state.completions.pop_front() {
            if let Some(entry) = state.entries.get(&token) {
                return Some((entry.handler.clone(), ops));
            }
        }
        None
    }

    /// Operations started on `handler` and not yet finished.
    pub fn pending(&self, handler: &Arc<dyn EventHandler>) -> SocketOperation {
        self.state
            .lock()
            .entries
            .get(&handler.native_info().token())
            .map(|entry| entry.pending)
            .unwrap_or_default()
    }
}

impl EventSelector for CompletionSelector {
    /// Registers interest. Each newly added operation immediately yields a
    /// completion so the owner starts its first asynchronous call.
    fn update(
        &self,
        handler: &Arc<dyn EventHandler>,
        remove: SocketOperation,
        add: SocketOperation,
    ) -> Result<()> {
        self.check_destroyed()?;
        let info = handler.native_info();
        let mut state = self.state.lock();

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
                    pending: SocketOperation::NONE,
                    armed: SocketOperation::NONE,
                    in_kernel: false,
                },
            );
            trace!(fd, token, "handler registered for completions");
        }

        let Some(entry) = state.entries.get_mut(&token) else {
            return Ok(());
        };
        let added = add & !entry.registered;
        entry.registered = (entry.registered & !remove) | add;
        entry.disabled = entry.disabled & !add;
        if !added.is_none() {
            state.post(token, added);
            drop(state);
            self.poller.wake()?;
        }
        Ok(())
    }

    fn enable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        let token = handler.native_info().token();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&token) else {
            return Ok(());
        };
        let enabled = entry.disabled & op & entry.registered;
        entry.disabled = entry.disabled & !op;
        if enabled.is_none() {
            return Ok(());
        }
        state.post(token, enabled);
        drop(state);
        self.poller.wake()
    }

    fn disable(&self, handler: &Arc<dyn EventHandler>, op: SocketOperation) -> Result<()> {
        self.check_destroyed()?;
        if let Some(entry) = self
            .state
            .lock()
            .entries
            .get_mut(&handler.native_info().token())
        {
            entry.disabled |= op;
        }
        Ok(())
    }

    /// Deregisters the handler. Its socket may only be closed right away
    /// when no asynchronous operation is still outstanding.
    fn finish(&self, handler: &Arc<dyn EventHandler>, close_now: bool) -> Result<bool> {
        let info = handler.native_info();
        let removed = {
            let mut state = self.state.lock();
            let token = info.token();
            state.completions.retain(|(t, _)| *t != token);
            state.entries.remove(&token)
        };
        info.set_token(WAKE_TOKEN);

        let Some(entry) = removed else {
            return Ok(close_now);
        };
        if entry.in_kernel && !self.destroyed.load(Ordering::Acquire) {
            self.poller.delete(entry.fd)?;
        }
        Ok(close_now && entry.pending.is_none())
    }

    fn interrupt(&self) -> Result<()> {
        self.poller.wake()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = {
            let mut state = self.state.lock();
            state.completions.clear();
            std::mem::take(&mut state.entries)
        };
        for (_, entry) in entries {
            entry.handler.native_info().set_token(WAKE_TOKEN);
            if entry.in_kernel {
                let _ = self.poller.delete(entry.fd);
            }
        }
        let _ = self.poller.wake();
        debug!("completion selector destroyed");
    }
}

impl fmt::Debug for CompletionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionSelector")
            .field("handlers", &state.entries.len())
            .field("completions", &state.completions.len())
            .finish()
    }
}
