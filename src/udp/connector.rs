use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::instance::{NETWORK, ProtocolInstance};
use crate::network::address;
use crate::transceiver::Transceiver;
use crate::udp::transceiver::UdpTransceiver;

/// Connector for one resolved UDP destination, unicast or multicast.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    instance: Arc<ProtocolInstance>,
    address: SocketAddr,
    source_address: Option<IpAddr>,
    mcast_interface: String,
    mcast_ttl: i32,
    connection_id: String,
}

impl UdpConnector {
    pub(crate) fn new(
        instance: Arc<ProtocolInstance>,
        address: SocketAddr,
        source_address: Option<IpAddr>,
        mcast_interface: String,
        mcast_ttl: i32,
        connection_id: String,
    ) -> Self {
        Self {
            instance,
            address,
            source_address,
            mcast_interface,
            mcast_ttl,
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

    /// Creates the client socket. The datagram "connect" happens in
    /// [`Transceiver::initialize`].
    pub(crate) fn connect(&self) -> Result<Box<dyn Transceiver>> {
        if self.instance.trace_level() >= 2 {
            trace!(
                target: NETWORK,
                "trying to establish {} connection to {}",
                self.instance.protocol(),
                self
            );
        }

        Ok(Box::new(UdpTransceiver::client(
            self.instance.clone(),
            self.address,
            self.source_address,
            &self.mcast_interface,
            self.mcast_ttl,
            self.connection_id.clone(),
        )?))
    }

    fn key(&self) -> (i16, &SocketAddr, &Option<IpAddr>, &str, i32, &str) {
        (
            self.instance.type_id(),
            &self.address,
            &self.source_address,
            &self.mcast_interface,
            self.mcast_ttl,
            &self.connection_id,
        )
    }
}

impl fmt::Display for UdpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&address::addr_to_string(&self.address))
    }
}

impl PartialEq for UdpConnector {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UdpConnector {}

impl PartialOrd for UdpConnector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UdpConnector {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for UdpConnector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
