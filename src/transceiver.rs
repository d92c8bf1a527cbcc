//! The non-blocking connection contract.
//!
//! A [`Transceiver`] owns one socket and moves bytes between it and a
//! [`Buffer`]; an [`Acceptor`] owns one listening socket and produces
//! transceivers. Every method returns promptly: when a call cannot make
//! progress without blocking it returns the [`SocketOperation`] the caller
//! must wait for before calling again.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::operation::SocketOperation;

/// Lifecycle of a transceiver's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransceiverState {
    NeedConnect,
    ConnectPending,
    Connected,
    /// Datagram socket bound for receiving; never goes through a
    /// stream-style connect.
    NotConnected,
    Closing,
    Closed,
}

/// Lifecycle of an acceptor's listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptorState {
    Unbound,
    Listening,
    Closed,
}

/// Snapshot describing an established connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub protocol: String,
    pub incoming: bool,
    pub adapter_name: String,
    pub connection_id: String,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub rcv_size: usize,
    pub snd_size: usize,
    /// Multicast group a UDP socket joined.
    pub mcast_address: Option<SocketAddr>,
    /// Handshake headers of a WebSocket connection.
    pub headers: Vec<(String, String)>,
    /// Info of the wrapped transport, for layered transceivers.
    pub underlying: Option<Box<ConnectionInfo>>,
}

/// One socket performing non-blocking partial I/O.
///
/// Callers drive the transceiver from one thread at a time.
pub trait Transceiver: Send {
    /// Native descriptor to register with a selector, or
    /// [`INVALID_FD`](crate::network::native::INVALID_FD) once closed.
    fn fd(&self) -> RawFd;

    /// Advances connection establishment. Returns the operation to wait
    /// for, or `NONE` once the transport handshake is complete. The buffers
    /// carry bytes a layered transport needs to exchange during its own
    /// handshake.
    fn initialize(&mut self, read_buf: &mut Buffer, write_buf: &mut Buffer)
    -> Result<SocketOperation>;

    /// Starts a graceful shutdown. Returns `READ` when the initiator must
    /// wait for the peer to close its side, `NONE` when the socket can be
    /// closed right away.
    fn closing(&mut self, initiator: bool, reason: Option<&TransportError>) -> SocketOperation;

    fn close(&mut self);

    /// Binds a datagram server socket and returns the endpoint carrying the
    /// effective port.
    fn bind(&mut self) -> Result<Arc<Endpoint>> {
        Err(TransportError::FeatureNotSupported {
            feature: format!("bind on a {} transceiver", self.protocol()),
        })
    }

    /// Writes from `buf`. `NONE` means `buf` is drained.
    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation>;

    /// Reads into `buf`. `NONE` means `buf` is filled.
    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation>;

    /// True when bytes were already pulled off the socket and buffered, so
    /// the caller must read again without waiting for readiness.
    fn has_pending_data(&self) -> bool {
        false
    }

    fn protocol(&self) -> &str;

    fn state(&self) -> TransceiverState;

    /// Short description, `local address = ...` / `remote address = ...`.
    fn describe(&self) -> String;

    fn to_detail_string(&self) -> String {
        self.describe()
    }

    fn info(&self) -> ConnectionInfo;

    /// Rejects a message that cannot be sent in one datagram.
    fn check_send_size(&self, _buf: &Buffer) -> Result<()> {
        Ok(())
    }

    fn set_buffer_size(&mut self, rcv_size: usize, snd_size: usize) -> Result<()>;
}

/// One listening socket.
pub trait Acceptor: Send {
    fn fd(&self) -> RawFd;

    /// Binds and listens. Returns the acceptor's endpoint with the
    /// effective port filled in.
    fn listen(&mut self) -> Result<Arc<Endpoint>>;

    /// Accepts one pending connection. `Ok(None)` means the readiness was
    /// spurious (the peer already went away).
    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>>;

    fn close(&mut self);

    fn protocol(&self) -> &str;

    fn state(&self) -> AcceptorState;

    fn endpoint(&self) -> Arc<Endpoint>;

    fn describe(&self) -> String;

    fn to_detail_string(&self) -> String {
        self.describe()
    }
}
