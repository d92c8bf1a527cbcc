//! OS-facing leaf layer: addresses, sockets, native handles and proxies.

pub mod address;
pub mod http;
pub mod native;
pub mod proxy;
pub mod socket;
pub mod stream_socket;

pub use address::ProtocolSupport;
pub use native::NativeInfo;
pub use proxy::NetworkProxy;
pub use stream_socket::{StreamSocket, StreamState};
