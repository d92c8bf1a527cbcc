//! Plain TCP transport.

pub mod acceptor;
pub mod connector;
pub mod endpoint;
pub mod transceiver;

pub use acceptor::TcpAcceptor;
pub use connector::TcpConnector;
pub use endpoint::TcpEndpoint;
pub use transceiver::TcpTransceiver;
