use std::fmt::Write as _;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::Socket;
use tracing::debug;

use crate::buffer::Buffer;
use crate::endpoint::Endpoint;
use crate::error::{self, Result, TransportError};
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::native::INVALID_FD;
use crate::network::{address, socket};
use crate::operation::SocketOperation;
use crate::transceiver::{ConnectionInfo, Transceiver, TransceiverState};

const MAX_DATAGRAM: usize = 65535;
const UDP_OVERHEAD_V4: usize = 20 + 8;
const UDP_OVERHEAD_V6: usize = 40 + 8;

/// Datagram transceiver.
///
/// A client socket is connected to its destination during
/// [`initialize`](Transceiver::initialize). A server socket is bound with
/// [`bind`](Transceiver::bind), stays `NotConnected` and replies to the
/// sender of the last datagram, unless the endpoint asked for `-c`, in
/// which case it connects to the first sender.
#[derive(Debug)]
pub struct UdpTransceiver {
    instance: Arc<ProtocolInstance>,
    endpoint: Option<Arc<Endpoint>>,
    socket: Option<Socket>,
    address: SocketAddr,
    source_address: Option<IpAddr>,
    mcast_interface: String,
    mcast_address: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    connect_to_peer: bool,
    connection_id: String,
    state: TransceiverState,
}

impl UdpTransceiver {
    /// Client socket sending to `address`, a unicast or multicast
    /// destination.
    pub(crate) fn client(
        instance: Arc<ProtocolInstance>,
        address: SocketAddr,
        source_address: Option<IpAddr>,
        mcast_interface: &str,
        mcast_ttl: i32,
        connection_id: String,
    ) -> Result<Self> {
        let raw = socket::create_socket(true, &address)?;
        let config = instance.config().clone();
        socket::set_buffer_sizes(&raw, &instance, config.udp_rcv_size, config.udp_snd_size)?;

        if socket::is_multicast(&address) {
            if !mcast_interface.is_empty() {
                socket::set_mcast_interface(&raw, mcast_interface, address.is_ipv6())?;
            }
            if mcast_ttl != -1 {
                socket::set_mcast_ttl(&raw, mcast_ttl as u32, address.is_ipv6())?;
            }
        }

        Ok(Self {
            instance,
            endpoint: None,
            socket: Some(raw),
            address,
            source_address,
            mcast_interface: mcast_interface.to_string(),
            mcast_address: None,
            peer: None,
            connect_to_peer: false,
            connection_id,
            state: TransceiverState::NeedConnect,
        })
    }

    /// Server socket for `host:port`, not yet bound.
    pub(crate) fn server(
        endpoint: Arc<Endpoint>,
        instance: Arc<ProtocolInstance>,
        host: &str,
        port: u16,
        mcast_interface: &str,
        connect: bool,
    ) -> Result<Self> {
        let address = address::get_address_for_server(
            host,
            port,
            instance.protocol_support(),
            instance.prefer_ipv6(),
            true,
        )?;
        let raw = socket::create_server_socket(true, &address)?;
        let config = instance.config().clone();
        socket::set_buffer_sizes(&raw, &instance, config.udp_rcv_size, config.udp_snd_size)?;

        Ok(Self {
            instance,
            endpoint: Some(endpoint),
            socket: Some(raw),
            address,
            source_address: None,
            mcast_interface: mcast_interface.to_string(),
            mcast_address: None,
            peer: None,
            connect_to_peer: connect,
            connection_id: String::new(),
            state: TransceiverState::NotConnected,
        })
    }

    fn raw(&self) -> Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("socket is closed".to_string()))
    }

    fn overhead(&self) -> usize {
        if self.address.is_ipv6() {
            UDP_OVERHEAD_V6
        } else {
            UDP_OVERHEAD_V4
        }
    }

    /// Largest payload the socket can carry in one datagram.
    pub fn max_packet_size(&self) -> usize {
        MAX_DATAGRAM - self.overhead()
    }

    /// Largest payload the socket can currently send, bounded by its send
    /// buffer.
    pub fn max_send_size(&self) -> usize {
        let snd_size = self.socket.as_ref().map(socket::send_buffer_size).unwrap_or(0);
        if snd_size == 0 {
            return self.max_packet_size();
        }
        self.max_packet_size()
            .min(snd_size.saturating_sub(self.overhead()))
    }

    fn max_receive_size(&self) -> usize {
        let rcv_size = self.socket.as_ref().map(socket::recv_buffer_size).unwrap_or(0);
        if rcv_size == 0 {
            return self.max_packet_size();
        }
        self.max_packet_size()
            .min(rcv_size.saturating_sub(self.overhead()).max(1))
    }

    fn is_server(&self) -> bool {
        self.endpoint.is_some()
    }

    fn trace_established(&self, what: &str) {
        if self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "{what} {} packets\n{}",
                self.instance.protocol(),
                self.describe()
            );
        }
    }
}

impl Transceiver for UdpTransceiver {
    fn fd(&self) -> RawFd {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .unwrap_or(INVALID_FD)
    }

    fn initialize(
        &mut self,
        _read_buf: &mut Buffer,
        _write_buf: &mut Buffer,
    ) -> Result<SocketOperation> {
        if self.state == TransceiverState::NeedConnect {
            self.state = TransceiverState::ConnectPending;
            let connected = socket::do_connect(self.raw()?, &self.address, self.source_address)?;
            if !connected {
                return Ok(SocketOperation::CONNECT);
            }
        }
        if self.state == TransceiverState::ConnectPending {
            socket::do_finish_connect(self.raw()?)?;
            self.state = TransceiverState::Connected;
            self.trace_established("starting to send");
        }
        Ok(SocketOperation::NONE)
    }

    fn closing(&mut self, _initiator: bool, _reason: Option<&TransportError>) -> SocketOperation {
        // No shutdown handshake for datagrams.
        SocketOperation::NONE
    }

    fn close(&mut self) {
        if self.socket.is_some()
            && self.state != TransceiverState::NeedConnect
            && self.instance.trace_level() >= 1
        {
            debug!(
                target: NETWORK,
                "closing {} connection\n{}",
                self.instance.protocol(),
                self.describe()
            );
        }
        self.socket = None;
        self.state = TransceiverState::Closed;
    }

    fn bind(&mut self) -> Result<Arc<Endpoint>> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Err(TransportError::InvalidState(
                "bind on a client datagram socket".to_string(),
            ));
        };

        let raw = self.raw()?;
        if socket::is_multicast(&self.address) {
            socket::set_reuse_address(raw, true)?;
            let bound = socket::do_bind(raw, &socket::any_address_like(&self.address))?;
            let group = SocketAddr::new(self.address.ip(), bound.port());
            socket::set_mcast_group(raw, &group.ip(), &self.mcast_interface)?;
            self.mcast_address = Some(group);
            self.address = group;
        } else {
            self.address = socket::do_bind(raw, &self.address)?;
        }

        self.trace_established("starting to receive");

        let bound = Arc::new(endpoint.with_port(self.address.port()));
        self.endpoint = Some(bound.clone());
        Ok(bound)
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        if buf.is_full() {
            return Ok(SocketOperation::NONE);
        }
        let raw = self.raw()?;

        loop {
            let sent = if self.state == TransceiverState::Connected {
                socket::send(raw, buf.remaining_slice())
            } else {
                let Some(peer) = self.peer else {
                    return Err(TransportError::Socket {
                        source: io::Error::from_raw_os_error(libc::EPIPE),
                    });
                };
                socket::send_to(raw, buf.remaining_slice(), &peer)
            };

            match sent {
                Ok(count) => {
                    debug_assert_eq!(count, buf.remaining());
                    buf.set_position(buf.len());
                    return Ok(SocketOperation::NONE);
                }
                Err(e) if error::interrupted(&e) => continue,
                Err(e) if error::would_block(&e) || error::no_buffers(&e) => {
                    return Ok(SocketOperation::WRITE);
                }
                Err(e) if error::connection_refused(&e) => {
                    return Err(TransportError::ConnectionRefused { source: e });
                }
                Err(e) => return Err(error::socket_error(e)),
            }
        }
    }

    /// Receives one datagram. The buffer is resized to the datagram and
    /// its cursor moved to the end.
    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        let packet_size = self.max_receive_size();
        buf.resize(packet_size);
        buf.set_position(0);

        let (count, from) = loop {
            let raw = self.raw()?;
            let received = if self.state == TransceiverState::Connected {
                socket::recv(raw, buf.remaining_mut()).map(|count| (count, None))
            } else {
                socket::recv_from(raw, buf.remaining_mut())
            };

            match received {
                Ok(received) => break received,
                Err(e) if error::interrupted(&e) => continue,
                Err(e) if error::would_block(&e) => return Ok(SocketOperation::READ),
                Err(e) if error::recv_truncated(&e) => break (packet_size, None),
                Err(e) if error::connection_refused(&e) => {
                    return Err(TransportError::ConnectionRefused { source: e });
                }
                Err(e) => return Err(error::socket_error(e)),
            }
        };

        if let Some(from) = from {
            self.peer = Some(from);
            if self.connect_to_peer && self.state == TransceiverState::NotConnected {
                socket::do_connect(self.raw()?, &from, None)?;
                self.state = TransceiverState::Connected;
                if self.instance.trace_level() >= 1 {
                    debug!(
                        target: NETWORK,
                        "connected {} socket\n{}",
                        self.instance.protocol(),
                        self.describe()
                    );
                }
            }
        }

        buf.resize(count);
        buf.set_position(count);
        Ok(SocketOperation::NONE)
    }

    fn protocol(&self) -> &str {
        self.instance.protocol()
    }

    fn state(&self) -> TransceiverState {
        self.state
    }

    fn describe(&self) -> String {
        let Some(raw) = &self.socket else {
            return "<closed>".to_string();
        };

        let mut description = if self.is_server() && self.state == TransceiverState::NotConnected {
            let local = socket::local_address(raw)
                .map(|a| address::addr_to_string(&a))
                .unwrap_or_else(|| "<not bound>".to_string());
            let mut text = format!("local address = {local}");
            if let Some(peer) = &self.peer {
                let _ = write!(text, "\nremote address = {}", address::addr_to_string(peer));
            }
            text
        } else {
            socket::describe(raw, None, None)
        };

        if let Some(group) = &self.mcast_address {
            let _ = write!(
                description,
                "\nmulticast address = {}",
                address::addr_to_string(group)
            );
        }
        description
    }

    fn to_detail_string(&self) -> String {
        let mut detail = self.describe();
        if self.mcast_address.is_some() || self.address.ip().is_unspecified() {
            let interfaces = address::local_addresses(self.instance.protocol_support(), true);
            let listed: Vec<String> = interfaces.iter().map(address::ip_to_string).collect();
            let _ = write!(detail, "\nlocal interfaces = {}", listed.join(", "));
        }
        detail
    }

    fn info(&self) -> ConnectionInfo {
        let raw = self.socket.as_ref();
        let remote = match self.state {
            TransceiverState::NotConnected => self.peer,
            _ => raw.and_then(socket::remote_address),
        };
        ConnectionInfo {
            protocol: self.instance.protocol().to_string(),
            incoming: self.is_server(),
            connection_id: self.connection_id.clone(),
            local_address: raw.and_then(socket::local_address),
            remote_address: remote,
            rcv_size: raw.map(socket::recv_buffer_size).unwrap_or(0),
            snd_size: raw.map(socket::send_buffer_size).unwrap_or(0),
            mcast_address: self.mcast_address,
            ..ConnectionInfo::default()
        }
    }

    fn check_send_size(&self, buf: &Buffer) -> Result<()> {
        let limit = self.max_send_size();
        if buf.len() > limit {
            return Err(TransportError::DatagramLimit {
                size: buf.len(),
                limit,
            });
        }
        Ok(())
    }

    fn set_buffer_size(&mut self, rcv_size: usize, snd_size: usize) -> Result<()> {
        let raw = self.raw()?;
        socket::set_buffer_sizes(
            raw,
            &self.instance,
            Some(socket::buffer_size_request(rcv_size)),
            Some(socket::buffer_size_request(snd_size)),
        )
    }
}
