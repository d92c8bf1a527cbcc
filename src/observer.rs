//! Instrumentation hooks.
//!
//! A [`TransportObserver`] installed through
//! [`TransportBuilder::observer`](crate::TransportBuilder::observer) is told
//! about host lookups and about the state of the threads the transport
//! layer owns. Every method has an empty default so implementors only
//! override what they record.

use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// What a transport-owned thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Idle,
    InUseForIo,
    InUseForUser,
    InUseForOther,
}

pub trait TransportObserver: Send + Sync {
    /// A blocking host lookup for `endpoint` is about to start.
    fn lookup_started(&self, _endpoint: &Endpoint) {}

    /// The lookup for `endpoint` failed. Followed by
    /// [`lookup_detached`](Self::lookup_detached).
    fn lookup_failed(&self, _endpoint: &Endpoint, _error: &TransportError) {}

    /// The lookup for `endpoint` finished, successfully or not.
    fn lookup_detached(&self, _endpoint: &Endpoint) {}

    fn thread_state_changed(&self, _thread: &str, _previous: ThreadState, _current: ThreadState) {}
}
