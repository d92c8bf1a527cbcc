use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::Socket;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::native::INVALID_FD;
use crate::network::stream_socket::StreamSocket;
use crate::network::{address, socket};
use crate::tcp::transceiver::TcpTransceiver;
use crate::transceiver::{Acceptor, AcceptorState, Transceiver};

/// Listening TCP socket of an object adapter.
pub struct TcpAcceptor {
    endpoint: Arc<Endpoint>,
    instance: Arc<ProtocolInstance>,
    adapter_name: String,
    socket: Option<Socket>,
    address: SocketAddr,
    state: AcceptorState,
}

impl TcpAcceptor {
    /// Creates the server socket for `host:port`. Binding happens in
    /// [`listen`](Acceptor::listen).
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        instance: Arc<ProtocolInstance>,
        host: &str,
        port: u16,
        adapter_name: &str,
    ) -> Result<Self> {
        let address = address::get_address_for_server(
            host,
            port,
            instance.protocol_support(),
            instance.prefer_ipv6(),
            true,
        )?;

        let raw = socket::create_server_socket(false, &address)?;
        // Rebinding a port still in TIME_WAIT must work after a restart.
        socket::set_reuse_address(&raw, true)?;
        let config = instance.config().clone();
        socket::set_buffer_sizes(&raw, &instance, config.tcp_rcv_size, config.tcp_snd_size)?;

        Ok(Self {
            endpoint,
            instance,
            adapter_name: adapter_name.to_string(),
            socket: Some(raw),
            address,
            state: AcceptorState::Unbound,
        })
    }

    fn raw(&self) -> Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("acceptor is closed".to_string()))
    }
}

impl Acceptor for TcpAcceptor {
    fn fd(&self) -> RawFd {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .unwrap_or(INVALID_FD)
    }

    fn listen(&mut self) -> Result<Arc<Endpoint>> {
        if self.state != AcceptorState::Unbound {
            return Err(TransportError::InvalidState(format!(
                "{} acceptor already {:?}",
                self.instance.protocol(),
                self.state
            )));
        }

        if self.instance.trace_level() >= 2 {
            trace!(
                target: NETWORK,
                "attempting to bind to {} socket {}",
                self.instance.protocol(),
                address::addr_to_string(&self.address)
            );
        }

        let raw = self.raw()?;
        let bound = socket::do_bind(raw, &self.address)?;
        socket::do_listen(raw, self.instance.config().tcp_backlog)?;
        self.address = bound;
        self.state = AcceptorState::Listening;

        if self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "listening for {} connections\n{}",
                self.instance.protocol(),
                self.describe()
            );
        }

        self.endpoint = Arc::new(self.endpoint.with_port(bound.port()));
        Ok(self.endpoint.clone())
    }

    fn accept(&mut self) -> Result<Option<Box<dyn Transceiver>>> {
        if self.state != AcceptorState::Listening {
            return Err(TransportError::InvalidState(format!(
                "accept on a {:?} acceptor",
                self.state
            )));
        }

        let Some(accepted) = socket::do_accept(self.raw()?)? else {
            return Ok(None);
        };
        let stream = StreamSocket::from_accepted(self.instance.clone(), accepted)?;

        if self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "accepted {} connection\n{}",
                self.instance.protocol(),
                stream
            );
        }

        Ok(Some(Box::new(TcpTransceiver::accepted(
            self.instance.clone(),
            stream,
            &self.adapter_name,
        ))))
    }

    fn close(&mut self) {
        if self.socket.take().is_some() && self.instance.trace_level() >= 1 {
            debug!(
                target: NETWORK,
                "stopping to accept {} connections at {}",
                self.instance.protocol(),
                address::addr_to_string(&self.address)
            );
        }
        self.state = AcceptorState::Closed;
    }

    fn protocol(&self) -> &str {
        self.instance.protocol()
    }

    fn state(&self) -> AcceptorState {
        self.state
    }

    fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.clone()
    }

    fn describe(&self) -> String {
        format!("local address = {}", address::addr_to_string(&self.address))
    }

    fn to_detail_string(&self) -> String {
        let mut detail = self.describe();
        if self.address.ip().is_unspecified() {
            let interfaces = address::local_addresses(self.instance.protocol_support(), true);
            let listed: Vec<String> = interfaces.iter().map(address::ip_to_string).collect();
            detail.push_str("\nlocal interfaces = ");
            detail.push_str(&listed.join(", "));
        }
        detail
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if self.state != AcceptorState::Closed {
            self.close();
        }
    }
}
