//! Connection-oriented socket with non-blocking connect, optional proxy
//! tunnelling and partial reads and writes.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::Socket;
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{self, Result, TransportError};
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::native::INVALID_FD;
use crate::network::proxy::NetworkProxy;
use crate::network::socket;
use crate::operation::SocketOperation;

/// Connection progress of a [`StreamSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    NeedConnect,
    ConnectPending,
    ProxyWrite,
    ProxyRead,
    Connected,
    Closed,
}

/// Largest single `send` once the kernel reported `ENOBUFS`.
const MIN_SEND_PACKET: usize = 1024;

pub struct StreamSocket {
    instance: Arc<ProtocolInstance>,
    socket: Option<Socket>,
    proxy: Option<NetworkProxy>,
    target: Option<SocketAddr>,
    state: StreamState,
    proxy_buf: Buffer,
    max_send_packet: usize,
    description: String,
}

impl StreamSocket {
    /// Starts connecting to `target`, through `proxy` when set.
    ///
    /// The socket is created and the connect issued immediately; the
    /// result is collected by [`connect`](Self::connect).
    pub fn connect_to(
        instance: Arc<ProtocolInstance>,
        proxy: Option<NetworkProxy>,
        target: SocketAddr,
        source: Option<IpAddr>,
    ) -> Result<Self> {
        let connect_address = match &proxy {
            Some(proxy) => proxy.address().ok_or_else(|| TransportError::DnsFailure {
                host: proxy.name().to_string(),
                reason: "proxy address not resolved".to_string(),
            })?,
            None => target,
        };

        let raw = socket::create_socket(false, &connect_address)?;
        let config = instance.config().clone();
        socket::set_buffer_sizes(&raw, &instance, config.tcp_rcv_size, config.tcp_snd_size)?;

        if instance.trace_level() >= 2 {
            trace!(
                target: NETWORK,
                protocol = instance.protocol(),
                address = %connect_address,
                "trying to establish connection"
            );
        }

        let connected = socket::do_connect(&raw, &connect_address, source)?;
        let state = match (connected, proxy.is_some()) {
            (true, true) => StreamState::ProxyWrite,
            (true, false) => StreamState::Connected,
            (false, _) => StreamState::NeedConnect,
        };

        let mut stream = Self {
            instance,
            socket: Some(raw),
            proxy,
            target: Some(target),
            state,
            proxy_buf: Buffer::new(),
            max_send_packet: usize::MAX,
            description: String::new(),
        };
        stream.refresh_description();
        if stream.state == StreamState::ProxyWrite {
            stream.begin_proxy_write()?;
        }
        Ok(stream)
    }

    /// Wraps an accepted, already connected socket.
    pub fn from_accepted(instance: Arc<ProtocolInstance>, raw: Socket) -> Result<Self> {
        let config = instance.config().clone();
        socket::set_buffer_sizes(&raw, &instance, config.tcp_rcv_size, config.tcp_snd_size)?;
        let mut stream = Self {
            instance,
            socket: Some(raw),
            proxy: None,
            target: None,
            state: StreamState::Connected,
            proxy_buf: Buffer::new(),
            max_send_packet: usize::MAX,
            description: String::new(),
        };
        stream.refresh_description();
        Ok(stream)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == StreamState::Connected
    }

    pub fn fd(&self) -> RawFd {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .unwrap_or(INVALID_FD)
    }

    pub fn raw(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    pub fn instance(&self) -> &Arc<ProtocolInstance> {
        &self.instance
    }

    fn raw_or_closed(&self) -> Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("socket is closed".to_string()))
    }

    /// Drives connection establishment. Returns `CONNECT` until the TCP
    /// connect completes, then `WRITE` / `READ` while a proxy handshake is
    /// in progress and `NONE` once the stream is usable.
    pub fn connect(&mut self) -> Result<SocketOperation> {
        loop {
            match self.state {
                StreamState::NeedConnect => {
                    self.state = StreamState::ConnectPending;
                    return Ok(SocketOperation::CONNECT);
                }
                StreamState::ConnectPending => {
                    let raw = self.raw_or_closed()?;
                    if !socket::connect_settled(raw)? {
                        return Ok(SocketOperation::CONNECT);
                    }
                    socket::do_finish_connect(raw)?;
                    self.refresh_description();
                    if self.proxy.is_some() {
                        self.state = StreamState::ProxyWrite;
                        self.begin_proxy_write()?;
                    } else {
                        self.state = StreamState::Connected;
                    }
                }
                StreamState::ProxyWrite => {
                    let mut buf = std::mem::take(&mut self.proxy_buf);
                    let result = self.write(&mut buf);
                    self.proxy_buf = buf;
                    if !result?.is_none() {
                        return Ok(SocketOperation::WRITE);
                    }
                    if let Some(proxy) = &self.proxy {
                        if proxy.end_write(&self.proxy_buf) != SocketOperation::READ {
                            return Ok(SocketOperation::WRITE);
                        }
                        proxy.begin_read(&mut self.proxy_buf);
                    }
                    self.state = StreamState::ProxyRead;
                }
                StreamState::ProxyRead => {
                    let mut buf = std::mem::take(&mut self.proxy_buf);
                    let result = self.read(&mut buf);
                    self.proxy_buf = buf;
                    if !result?.is_none() {
                        return Ok(SocketOperation::READ);
                    }
                    let Some(proxy) = &self.proxy else {
                        self.state = StreamState::Connected;
                        continue;
                    };
                    if proxy.end_read(&mut self.proxy_buf)?.is_none() {
                        self.proxy_buf.clear();
                        self.state = StreamState::Connected;
                    }
                }
                StreamState::Connected => return Ok(SocketOperation::NONE),
                StreamState::Closed => {
                    return Err(TransportError::InvalidState(
                        "connect on a closed socket".to_string(),
                    ));
                }
            }
        }
    }

    fn begin_proxy_write(&mut self) -> Result<()> {
        if let (Some(proxy), Some(target)) = (&self.proxy, &self.target) {
            proxy.begin_write(target, &mut self.proxy_buf)?;
        }
        Ok(())
    }

    /// Reads until `buf` is full or the socket would block.
    pub fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        let raw = self.raw_or_closed()?;
        while !buf.is_full() {
            match socket::recv(raw, buf.remaining_mut()) {
                Ok(0) => return Err(TransportError::ConnectionLost { source: None }),
                Ok(count) => buf.advance(count),
                Err(e) if error::interrupted(&e) => continue,
                Err(e) if error::would_block(&e) => return Ok(SocketOperation::READ),
                Err(e) => return Err(error::classify_io_error(e)),
            }
        }
        Ok(SocketOperation::NONE)
    }

    /// Writes until `buf` is drained or the socket would block.
    pub fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        while !buf.is_full() {
            let raw = self.raw_or_closed()?;
            let chunk = buf.remaining().min(self.max_send_packet);
            match socket::send(raw, &buf.remaining_slice()[..chunk]) {
                Ok(0) => return Err(TransportError::ConnectionLost { source: None }),
                Ok(count) => buf.advance(count),
                Err(e) if error::interrupted(&e) => continue,
                Err(e) if error::no_buffers(&e) && chunk > MIN_SEND_PACKET => {
                    self.max_send_packet = (chunk / 2).max(MIN_SEND_PACKET);
                    continue;
                }
                Err(e) if error::would_block(&e) => return Ok(SocketOperation::WRITE),
                Err(e) => return Err(error::classify_io_error(e)),
            }
        }
        Ok(SocketOperation::NONE)
    }

    pub fn set_buffer_size(&mut self, rcv_size: usize, snd_size: usize) -> Result<()> {
        let raw = self.raw_or_closed()?;
        socket::set_buffer_sizes(
            raw,
            &self.instance,
            Some(socket::buffer_size_request(rcv_size)),
            Some(socket::buffer_size_request(snd_size)),
        )
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(socket::local_address)
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        match (&self.proxy, &self.target) {
            (Some(_), Some(target)) => Some(*target),
            _ => self.socket.as_ref().and_then(socket::remote_address),
        }
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.socket.as_ref().map(socket::recv_buffer_size).unwrap_or(0)
    }

    pub fn send_buffer_size(&self) -> usize {
        self.socket.as_ref().map(socket::send_buffer_size).unwrap_or(0)
    }

    fn refresh_description(&mut self) {
        if let Some(raw) = &self.socket {
            let proxy = self.proxy.as_ref().and_then(NetworkProxy::address);
            self.description = socket::describe(raw, proxy.as_ref(), self.target.as_ref());
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Closes the socket. Further I/O fails with
    /// [`TransportError::InvalidState`].
    pub fn close(&mut self) {
        self.socket = None;
        self.state = StreamState::Closed;
    }
}

impl fmt::Display for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("fd", &self.fd())
            .field("state", &self.state)
            .field("proxy", &self.proxy)
            .finish()
    }
}
