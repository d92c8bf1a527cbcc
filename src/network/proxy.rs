//! Outbound network proxies: SOCKS4 and HTTP `CONNECT`.
//!
//! A proxy handshake runs inside [`StreamSocket`](super::stream_socket::StreamSocket)
//! after the TCP connect to the proxy completes: the request is written
//! from one buffer, then the reply is read into another until the proxy
//! grants or refuses the tunnel.

use std::net::{IpAddr, SocketAddr};

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};
use crate::network::address::{self, ProtocolSupport};
use crate::network::http::{self, HttpMessage};
use crate::operation::SocketOperation;

const SOCKS_VERSION: u8 = 4;
const SOCKS_CONNECT: u8 = 1;
const SOCKS_GRANTED: u8 = 0x5a;
const SOCKS_REPLY_LEN: usize = 8;

/// Initial read size for an HTTP reply. The buffer then grows one byte at
/// a time so no tunnelled payload is consumed.
const HTTP_MIN_REPLY_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyKind {
    Socks,
    Http,
}

/// A configured proxy and, once resolved, its socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkProxy {
    kind: ProxyKind,
    host: String,
    port: u16,
    address: Option<SocketAddr>,
}

impl NetworkProxy {
    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyKind::Socks, host.into(), port)
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyKind::Http, host.into(), port)
    }

    fn new(kind: ProxyKind, host: String, port: u16) -> Self {
        let address = address::parse_numeric(&host).map(|ip| SocketAddr::new(ip, port));
        Self {
            kind,
            host,
            port,
            address,
        }
    }

    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ProxyKind::Socks => "SOCKS",
            ProxyKind::Http => "HTTP",
        }
    }

    /// Proxy address; `None` until [`resolve_host`](Self::resolve_host)
    /// succeeded for a named proxy host.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Resolves the proxy host, blocking if needed. Must run on the resolver
    /// thread.
    pub fn resolve_host(&self, protocol: ProtocolSupport, prefer_ipv6: bool) -> Result<Self> {
        if self.address.is_some() {
            return Ok(self.clone());
        }
        let addresses = address::get_addresses(&self.host, self.port, protocol, prefer_ipv6, true)?;
        Ok(Self {
            address: addresses.first().copied(),
            ..self.clone()
        })
    }

    /// Address families reachable through the proxy. SOCKS4 only carries
    /// IPv4 targets.
    pub fn protocol_support(&self, configured: ProtocolSupport) -> ProtocolSupport {
        match self.kind {
            ProxyKind::Socks => ProtocolSupport::Ipv4,
            ProxyKind::Http => configured,
        }
    }

    /// Fills `buf` with the tunnel request for `target`.
    pub fn begin_write(&self, target: &SocketAddr, buf: &mut Buffer) -> Result<()> {
        match self.kind {
            ProxyKind::Socks => {
                let IpAddr::V4(ip) = target.ip() else {
                    return Err(TransportError::FeatureNotSupported {
                        feature: "IPv6 target through a SOCKS4 proxy".to_string(),
                    });
                };
                let mut request = Vec::with_capacity(9);
                request.push(SOCKS_VERSION);
                request.push(SOCKS_CONNECT);
                request.extend_from_slice(&target.port().to_be_bytes());
                request.extend_from_slice(&ip.octets());
                request.push(0);
                buf.reset(request);
            }
            ProxyKind::Http => {
                let authority = address::addr_to_string(target);
                let request =
                    format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
                buf.reset(request.into_bytes());
            }
        }
        Ok(())
    }

    /// Called once the request is fully written; returns the operation to
    /// wait for next.
    pub fn end_write(&self, buf: &Buffer) -> SocketOperation {
        if buf.is_full() {
            SocketOperation::READ
        } else {
            SocketOperation::WRITE
        }
    }

    /// Prepares `buf` for the proxy reply.
    pub fn begin_read(&self, buf: &mut Buffer) {
        let len = match self.kind {
            ProxyKind::Socks => SOCKS_REPLY_LEN,
            ProxyKind::Http => HTTP_MIN_REPLY_LEN,
        };
        buf.reset(vec![0; len]);
    }

    /// Inspects the bytes read so far. Returns `READ` while the reply is
    /// incomplete and `NONE` once the tunnel is established.
    pub fn end_read(&self, buf: &mut Buffer) -> Result<SocketOperation> {
        if !buf.is_full() {
            return Ok(SocketOperation::READ);
        }

        match self.kind {
            ProxyKind::Socks => {
                let reply = buf.as_slice();
                if reply[0] != 0 || reply[1] != SOCKS_GRANTED {
                    return Err(TransportError::ConnectFailed {
                        reason: format!("SOCKS proxy refused the connection (code {})", reply[1]),
                    });
                }
                Ok(SocketOperation::NONE)
            }
            ProxyKind::Http => {
                let Some(end) = http::header_end(buf.as_slice()) else {
                    let len = buf.len();
                    buf.resize(len + 1);
                    return Ok(SocketOperation::READ);
                };
                let reply = HttpMessage::parse(&buf.as_slice()[..end])?;
                match reply.status() {
                    Some(status) if (200..300).contains(&status) => Ok(SocketOperation::NONE),
                    Some(status) => Err(TransportError::ConnectFailed {
                        reason: format!("HTTP proxy refused the connection (status {status})"),
                    }),
                    None => Err(TransportError::protocol("HTTP proxy sent a request")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks_request_layout() {
        let proxy = NetworkProxy::socks("127.0.0.1", 1080);
        let mut buf = Buffer::new();
        proxy
            .begin_write(&"10.1.2.3:4061".parse().unwrap(), &mut buf)
            .unwrap();
        assert_eq!(buf.as_slice(), &[4, 1, 0x0f, 0xdd, 10, 1, 2, 3, 0]);
    }

    #[test]
    fn socks_rejects_ipv6_targets() {
        let proxy = NetworkProxy::socks("127.0.0.1", 1080);
        let mut buf = Buffer::new();
        assert!(proxy.begin_write(&"[::1]:80".parse().unwrap(), &mut buf).is_err());
    }

    #[test]
    fn socks_reply_codes() {
        let proxy = NetworkProxy::socks("127.0.0.1", 1080);
        let mut buf = Buffer::from_vec(vec![0, 0x5a, 0, 0, 0, 0, 0, 0]);
        buf.advance(8);
        assert_eq!(proxy.end_read(&mut buf).unwrap(), SocketOperation::NONE);

        let mut buf = Buffer::from_vec(vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
        buf.advance(8);
        assert!(proxy.end_read(&mut buf).is_err());
    }

    #[test]
    fn http_reply_grows_until_complete() {
        let proxy = NetworkProxy::http("127.0.0.1", 3128);
        let mut buf = Buffer::new();
        proxy.begin_read(&mut buf);

        let reply = b"HTTP/1.1 200 OK\r\n\r\n";
        loop {
            let position = buf.position();
            buf.remaining_mut()[0] = reply[position];
            buf.advance(1);
            if proxy.end_read(&mut buf).unwrap() == SocketOperation::NONE {
                break;
            }
        }
        assert_eq!(buf.len(), reply.len());
    }

    #[test]
    fn proxy_address_is_known_for_numeric_hosts() {
        assert!(NetworkProxy::http("127.0.0.1", 3128).address().is_some());
        assert!(NetworkProxy::http("proxy.local", 3128).address().is_none());
    }
}
