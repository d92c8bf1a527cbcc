use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::address;
use crate::network::proxy::NetworkProxy;
use crate::network::stream_socket::StreamSocket;
use crate::tcp::transceiver::TcpTransceiver;
use crate::transceiver::Transceiver;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    instance: Arc<ProtocolInstance>,
    address: SocketAddr,
    proxy: Option<NetworkProxy>,
    source_address: Option<IpAddr>,
    timeout: i32,
    connection_id: String,
}

impl TcpConnector {
    pub(crate) fn new(
        instance: Arc<ProtocolInstance>,
        address: SocketAddr,
        proxy: Option<NetworkProxy>,
        source_address: Option<IpAddr>,
        timeout: i32,
        connection_id: String,
    ) -> Self {
        Self {
            instance,
            address,
            proxy,
            source_address,
            timeout,
            connection_id,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn type_id(&self) -> i16 {
        self.instance.type_id()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn connect(&self) -> Result<Box<dyn Transceiver>> {
        if self.instance.trace_level() >= 2 {
            trace!(
                target: NETWORK,
                "trying to establish {} connection to {}",
                self.instance.protocol(),
                self
            );
        }

        match StreamSocket::connect_to(
            self.instance.clone(),
            self.proxy.clone(),
            self.address,
            self.source_address,
        ) {
            Ok(stream) => Ok(Box::new(TcpTransceiver::connecting(
                self.instance.clone(),
                stream,
                self.connection_id.clone(),
            ))),
            Err(error) => {
                if self.instance.trace_level() >= 2 {
                    trace!(
                        target: NETWORK,
                        %error,
                        "failed to establish {} connection to {}",
                        self.instance.protocol(),
                        self
                    );
                }
                Err(error)
            }
        }
    }

    fn key(
        &self,
    ) -> (
        i16,
        &SocketAddr,
        &Option<NetworkProxy>,
        i32,
        &Option<IpAddr>,
        &str,
    ) {
        (
            self.instance.type_id(),
            &self.address,
            &self.proxy,
            self.timeout,
            &self.source_address,
            &self.connection_id,
        )
    }
}

impl fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy.as_ref().and_then(NetworkProxy::address) {
            Some(proxy) => f.write_str(&address::addr_to_string(&proxy)),
            None => f.write_str(&address::addr_to_string(&self.address)),
        }
    }
}

impl PartialEq for TcpConnector {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TcpConnector {}

impl PartialOrd for TcpConnector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TcpConnector {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for TcpConnector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
