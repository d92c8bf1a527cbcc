//! WebSocket transport, layered over a stream carrier.

pub mod acceptor;
pub mod connector;
pub mod endpoint;
pub mod frame;
pub mod transceiver;

pub use acceptor::WsAcceptor;
pub use connector::WsConnector;
pub use endpoint::WsEndpoint;
pub use transceiver::WsTransceiver;
