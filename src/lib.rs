//! Transport layer of an RPC runtime.
//!
//! This crate turns endpoint descriptions such as
//! `tcp -h example.com -p 4061 -t 5000` into connected, non-blocking
//! sockets and multiplexes their readiness for an external pool of I/O
//! threads.
//!
//! # Architecture
//!
//! - **Endpoint**: immutable, protocol-tagged address plus options, parsed
//!   from text or decoded from its binary encoding by an endpoint factory
//! - **Connector**: one resolved address ready to attempt a connection
//! - **Acceptor**: a listening socket producing transceivers
//! - **Transceiver**: one socket doing non-blocking partial I/O, answering
//!   with the [`SocketOperation`] it must wait for
//! - **EndpointHostResolver**: background DNS thread feeding connectors
//!   back through a callback
//! - **Selector**: readiness reactor over epoll, kqueue or poll, plus a
//!   completion-model variant
//! - **TransportBuilder**: fluent construction of the runtime root,
//!   [`TransportInstance`]
//!
//! Transports: `tcp`, `udp` (unicast and multicast) and `ws`, WebSocket
//! layered over any stream carrier.

mod buffer;
mod builder;
pub mod config;
mod connector;
pub mod endpoint;
mod error;
mod instance;
pub mod network;
mod observer;
mod operation;
mod resolver;
pub mod selector;
pub mod stream;
pub mod tcp;
mod transceiver;
pub mod udp;
pub mod ws;

pub use buffer::Buffer;
pub use builder::TransportBuilder;
pub use config::{Properties, TransportConfig};
pub use connector::Connector;
pub use endpoint::{Endpoint, EndpointInfo};
pub use error::{Result, TransportError};
pub use instance::{BufferKind, ProtocolInstance, TransportInstance};
pub use network::NativeInfo;
pub use observer::{ThreadState, TransportObserver};
pub use operation::SocketOperation;
pub use resolver::{ConnectorsCallback, EndpointHostResolver};
pub use selector::completion::CompletionSelector;
pub use selector::{EventHandler, EventSelector, Selector};
pub use transceiver::{Acceptor, AcceptorState, ConnectionInfo, Transceiver, TransceiverState};
