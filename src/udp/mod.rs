//! UDP transport, unicast and multicast.

pub mod connector;
pub mod endpoint;
pub mod transceiver;

pub use connector::UdpConnector;
pub use endpoint::UdpEndpoint;
pub use transceiver::UdpTransceiver;
