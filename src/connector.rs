//! Resolved, connectable destinations.

use std::fmt;

use crate::error::Result;
use crate::tcp::connector::TcpConnector;
use crate::transceiver::Transceiver;
use crate::udp::connector::UdpConnector;
use crate::ws::connector::WsConnector;

/// One `(address, options)` pair produced by
/// [`Endpoint::connectors`](crate::Endpoint::connectors).
///
/// Connectors compare equal when they lead to the same destination with
/// the same options, so a connection pool can use them as keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Connector {
    Tcp(TcpConnector),
    Udp(UdpConnector),
    Ws(WsConnector),
}

impl Connector {
    /// Starts the connection attempt and returns the transceiver driving
    /// it. The transceiver still has to be initialized.
    pub fn connect(&self) -> Result<Box<dyn Transceiver>> {
        match self {
            Self::Tcp(tcp) => tcp.connect(),
            Self::Udp(udp) => udp.connect(),
            Self::Ws(ws) => ws.connect(),
        }
    }

    pub fn type_id(&self) -> i16 {
        match self {
            Self::Tcp(tcp) => tcp.type_id(),
            Self::Udp(udp) => udp.type_id(),
            Self::Ws(ws) => ws.type_id(),
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(tcp) => fmt::Display::fmt(tcp, f),
            Self::Udp(udp) => fmt::Display::fmt(udp, f),
            Self::Ws(ws) => fmt::Display::fmt(ws, f),
        }
    }
}
