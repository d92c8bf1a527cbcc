//! Immutable, protocol-tagged endpoints.
//!
//! An [`Endpoint`] is created by an [`EndpointFactory`](factory::EndpointFactory)
//! from option tokens or from its binary encoding, and never changes
//! afterwards. The `with_*` derivations return the *same* `Arc` when the
//! requested value is already set, so callers can compare by pointer to
//! detect a no-op.
//!
//! # Example
//! ```ignore
//! let endpoint = transport.create_endpoint("tcp -h 127.0.0.1 -p 4061", false)?.unwrap();
//! assert!(Arc::ptr_eq(&endpoint, &endpoint.with_timeout(endpoint.timeout())));
//! ```

pub mod factory;
pub mod ip;
pub mod manager;
pub mod opaque;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::connector::Connector;
use crate::error::{Result, TransportError};
use crate::instance::ProtocolInstance;
use crate::network::address;
use crate::network::proxy::NetworkProxy;
use crate::resolver::ConnectorsCallback;
use crate::stream::{EncodingVersion, OutputStream};
use crate::tcp::endpoint::TcpEndpoint;
use crate::transceiver::{Acceptor, Transceiver};
use crate::udp::endpoint::UdpEndpoint;
use crate::ws::endpoint::WsEndpoint;
use crate::ws::connector::WsConnector;
use crate::ws::acceptor::WsAcceptor;

use self::ip::IpEndpoint;
use self::opaque::OpaqueEndpoint;

pub const TCP_ENDPOINT_TYPE: i16 = 1;
pub const SSL_ENDPOINT_TYPE: i16 = 2;
pub const UDP_ENDPOINT_TYPE: i16 = 3;
pub const WS_ENDPOINT_TYPE: i16 = 4;
pub const WSS_ENDPOINT_TYPE: i16 = 5;

/// A network address plus transport options.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Udp(UdpEndpoint),
    /// Layered: wraps the endpoint of its carrier transport.
    Ws(WsEndpoint),
    Opaque(OpaqueEndpoint),
}

/// Snapshot of an endpoint's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    pub type_id: i16,
    pub protocol: String,
    pub timeout: i32,
    pub compress: bool,
    pub datagram: bool,
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub source_address: Option<IpAddr>,
    pub mcast_interface: String,
    pub mcast_ttl: i32,
    pub resource: String,
    pub raw_encoding: Option<EncodingVersion>,
    pub raw_bytes: Vec<u8>,
    pub underlying: Option<Box<EndpointInfo>>,
}

impl Endpoint {
    fn instance(&self) -> Option<&Arc<ProtocolInstance>> {
        match self {
            Self::Tcp(tcp) => Some(&tcp.ip.instance),
            Self::Udp(udp) => Some(&udp.ip.instance),
            Self::Ws(ws) => Some(&ws.instance),
            Self::Opaque(_) => None,
        }
    }

    pub fn type_id(&self) -> i16 {
        match self {
            Self::Opaque(opaque) => opaque.type_id(),
            _ => self.instance().map(|i| i.type_id()).unwrap_or_default(),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            Self::Opaque(_) => "opaque",
            _ => self.instance().map(|i| i.protocol()).unwrap_or_default(),
        }
    }

    /// Timeout in milliseconds, `-1` for infinite or not applicable.
    pub fn timeout(&self) -> i32 {
        match self {
            Self::Tcp(tcp) => tcp.timeout(),
            Self::Ws(ws) => ws.delegate.timeout(),
            Self::Udp(_) | Self::Opaque(_) => -1,
        }
    }

    pub fn with_timeout(self: &Arc<Self>, timeout: i32) -> Arc<Self> {
        match self.as_ref() {
            Self::Tcp(tcp) if tcp.timeout() != timeout => {
                Arc::new(Self::Tcp(tcp.with_timeout(timeout)))
            }
            Self::Ws(ws) => self.with_new_delegate(ws, ws.delegate.with_timeout(timeout)),
            _ => self.clone(),
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            Self::Ws(ws) => ws.delegate.connection_id(),
            _ => self.ip().map(IpEndpoint::connection_id).unwrap_or_default(),
        }
    }

    pub fn with_connection_id(self: &Arc<Self>, connection_id: &str) -> Arc<Self> {
        match self.as_ref() {
            Self::Ws(ws) => self.with_new_delegate(ws, ws.delegate.with_connection_id(connection_id)),
            _ => match self.ip() {
                Some(ip) if ip.connection_id() != connection_id => self
                    .map_ip(|ip| ip.with_connection_id(connection_id))
                    .map(Arc::new)
                    .unwrap_or_else(|| self.clone()),
                _ => self.clone(),
            },
        }
    }

    pub fn compress(&self) -> bool {
        match self {
            Self::Tcp(tcp) => tcp.compress(),
            Self::Udp(udp) => udp.compress(),
            Self::Ws(ws) => ws.delegate.compress(),
            Self::Opaque(_) => false,
        }
    }

    pub fn with_compress(self: &Arc<Self>, compress: bool) -> Arc<Self> {
        match self.as_ref() {
            Self::Tcp(tcp) if tcp.compress() != compress => {
                Arc::new(Self::Tcp(tcp.with_compress(compress)))
            }
            Self::Udp(udp) if udp.compress() != compress => {
                Arc::new(Self::Udp(udp.with_compress(compress)))
            }
            Self::Ws(ws) => self.with_new_delegate(ws, ws.delegate.with_compress(compress)),
            _ => self.clone(),
        }
    }

    /// Rewraps `ws` around `delegate`, keeping `self` when the delegate did
    /// not change.
    fn with_new_delegate(self: &Arc<Self>, ws: &WsEndpoint, delegate: Arc<Self>) -> Arc<Self> {
        if Arc::ptr_eq(&delegate, &ws.delegate) {
            self.clone()
        } else {
            Arc::new(Self::Ws(ws.with_delegate(delegate)))
        }
    }

    pub fn datagram(&self) -> bool {
        matches!(self, Self::Udp(_))
    }

    pub fn secure(&self) -> bool {
        self.instance().is_some_and(|i| i.secure())
    }

    /// True for endpoints wrapping another endpoint.
    pub fn is_layered(&self) -> bool {
        matches!(self, Self::Ws(_))
    }

    /// The IP fields of this endpoint or of the endpoint it wraps.
    pub fn ip(&self) -> Option<&IpEndpoint> {
        match self {
            Self::Tcp(tcp) => Some(&tcp.ip),
            Self::Udp(udp) => Some(&udp.ip),
            Self::Ws(ws) => ws.delegate.ip(),
            Self::Opaque(_) => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.ip().map(IpEndpoint::host)
    }

    pub fn port(&self) -> Option<u16> {
        self.ip().map(IpEndpoint::port)
    }

    /// Rebuilds the endpoint with its IP fields transformed by `f`,
    /// rewrapping layered endpoints.
    fn map_ip(&self, f: impl FnOnce(&IpEndpoint) -> IpEndpoint) -> Option<Self> {
        match self {
            Self::Tcp(tcp) => Some(Self::Tcp(tcp.with_ip(f(&tcp.ip)))),
            Self::Udp(udp) => Some(Self::Udp(udp.with_ip(f(&udp.ip)))),
            Self::Ws(ws) => ws
                .delegate
                .map_ip(f)
                .map(|delegate| Self::Ws(ws.with_delegate(Arc::new(delegate)))),
            Self::Opaque(_) => None,
        }
    }

    /// Same endpoint with the effective port learned after a bind.
    pub(crate) fn with_port(&self, port: u16) -> Self {
        self.map_ip(|ip| ip.with_port(port))
            .unwrap_or_else(|| self.clone())
    }

    /// Server-side datagram socket for this endpoint. `None` for stream
    /// transports, which use [`acceptor`](Self::acceptor).
    pub fn transceiver(self: &Arc<Self>) -> Result<Option<Box<dyn Transceiver>>> {
        match self.as_ref() {
            Self::Udp(udp) => UdpEndpoint::server_transceiver(self, udp).map(Some),
            _ => Ok(None),
        }
    }

    /// Listening socket for this endpoint. `None` for datagram transports
    /// and opaque endpoints.
    pub fn acceptor(self: &Arc<Self>, adapter_name: &str) -> Result<Option<Box<dyn Acceptor>>> {
        match self.as_ref() {
            Self::Tcp(tcp) => TcpEndpoint::acceptor(self, tcp, adapter_name).map(Some),
            Self::Ws(ws) => {
                let Some(delegate) = ws.delegate.acceptor(adapter_name)? else {
                    return Ok(None);
                };
                Ok(Some(Box::new(WsAcceptor::new(
                    self.clone(),
                    ws.instance.clone(),
                    delegate,
                ))))
            }
            Self::Udp(_) | Self::Opaque(_) => Ok(None),
        }
    }

    /// Resolves the endpoint's host and hands the connectors to
    /// `callback`, inline for numeric hosts and from the resolver thread
    /// otherwise.
    pub fn connectors_async(self: &Arc<Self>, callback: ConnectorsCallback) {
        match self.as_ref() {
            Self::Tcp(TcpEndpoint { ip, .. }) | Self::Udp(UdpEndpoint { ip, .. }) => {
                ip.instance.resolve(&ip.host, ip.port, self.clone(), callback);
            }
            Self::Ws(ws) => {
                let instance = ws.instance.clone();
                let host = ws.http_host();
                let resource = ws.resource().to_string();
                ws.delegate.connectors_async(Box::new(move |result| {
                    callback(result.map(|connectors| {
                        connectors
                            .into_iter()
                            .map(|delegate| {
                                Connector::Ws(WsConnector::new(
                                    instance.clone(),
                                    delegate,
                                    host.clone(),
                                    resource.clone(),
                                ))
                            })
                            .collect()
                    }))
                }));
            }
            Self::Opaque(_) => callback(Ok(Vec::new())),
        }
    }

    /// One connector per resolved address.
    pub fn connectors(&self, addresses: &[SocketAddr], proxy: Option<&NetworkProxy>) -> Vec<Connector> {
        match self {
            Self::Tcp(tcp) => tcp.connectors(addresses, proxy),
            Self::Udp(udp) => udp.connectors(addresses),
            Self::Ws(ws) => {
                let host = ws.http_host();
                ws.delegate
                    .connectors(addresses, proxy)
                    .into_iter()
                    .map(|delegate| {
                        Connector::Ws(WsConnector::new(
                            ws.instance.clone(),
                            delegate,
                            host.clone(),
                            ws.resource().to_string(),
                        ))
                    })
                    .collect()
            }
            Self::Opaque(_) => Vec::new(),
        }
    }

    /// Expands a wildcard host into one endpoint per local interface
    /// address. Other endpoints are returned unchanged.
    pub fn expand_if_wildcard(self: &Arc<Self>) -> Vec<Arc<Self>> {
        let Some(ip) = self.ip() else {
            return vec![self.clone()];
        };
        let hosts = address::hosts_for_endpoint_expand(
            ip.host(),
            ip.instance().protocol_support(),
            false,
        );
        if hosts.is_empty() {
            return vec![self.clone()];
        }
        hosts
            .iter()
            .filter_map(|host| self.map_ip(|ip| ip.with_host(host)))
            .map(Arc::new)
            .collect()
    }

    /// Resolves the host into one endpoint per address.
    ///
    /// An empty host is returned unchanged. The second element is the
    /// endpoint to publish in place of the expanded ones; it is set when
    /// the port is fixed, since the name then reaches every address.
    pub fn expand_host(self: &Arc<Self>) -> Result<(Vec<Arc<Self>>, Option<Arc<Self>>)> {
        let Some(ip) = self.ip() else {
            return Ok((vec![self.clone()], None));
        };
        if ip.host().is_empty() {
            return Ok((vec![self.clone()], None));
        }

        let publish = (ip.port() > 0).then(|| self.clone());
        let instance = ip.instance();
        let addresses = address::get_addresses(
            ip.host(),
            ip.port(),
            instance.protocol_support(),
            instance.prefer_ipv6(),
            true,
        )?;
        if addresses.len() == 1 {
            return Ok((vec![self.clone()], publish));
        }

        let endpoints = addresses
            .iter()
            .filter_map(|address| self.map_ip(|ip| ip.with_address(address)))
            .map(Arc::new)
            .collect();
        Ok((endpoints, publish))
    }

    /// Server endpoint advertised under `host`. An empty `host` keeps the
    /// endpoint as is.
    pub fn to_published_endpoint(self: &Arc<Self>, host: &str) -> Arc<Self> {
        let Some(ip) = self.ip() else {
            return self.clone();
        };
        debug_assert!(
            ip.source_address().is_none() && ip.connection_id().is_empty(),
            "server endpoints carry neither a source address nor a connection id"
        );
        if host.is_empty() {
            return self.clone();
        }
        self.map_ip(|ip| ip.with_host(host))
            .map(Arc::new)
            .unwrap_or_else(|| self.clone())
    }

    /// True if both endpoints reach the same transport destination,
    /// regardless of timeout, compression and connection id.
    pub fn equivalent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ws(a), Self::Ws(b)) => {
                a.instance.type_id() == b.instance.type_id() && a.delegate.equivalent(&b.delegate)
            }
            (Self::Opaque(_), _) | (_, Self::Opaque(_)) => false,
            (a, b) if a.type_id() == b.type_id() && !a.is_layered() && !b.is_layered() => {
                match (a.ip(), b.ip()) {
                    (Some(a), Some(b)) => a.equivalent(b),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    pub fn info(&self) -> EndpointInfo {
        let mut info = EndpointInfo {
            type_id: self.type_id(),
            protocol: self.protocol().to_string(),
            timeout: self.timeout(),
            compress: self.compress(),
            datagram: self.datagram(),
            secure: self.secure(),
            mcast_ttl: -1,
            ..EndpointInfo::default()
        };

        match self {
            Self::Tcp(tcp) => fill_ip_info(&mut info, &tcp.ip),
            Self::Udp(udp) => {
                fill_ip_info(&mut info, &udp.ip);
                info.mcast_interface = udp.mcast_interface().to_string();
                info.mcast_ttl = udp.mcast_ttl();
            }
            Self::Ws(ws) => {
                info.resource = ws.resource().to_string();
                info.underlying = Some(Box::new(ws.delegate.info()));
            }
            Self::Opaque(opaque) => {
                info.raw_encoding = Some(opaque.raw_encoding());
                info.raw_bytes = opaque.raw_bytes().to_vec();
            }
        }
        info
    }

    /// Option string without the protocol name, e.g.
    /// ` -h 127.0.0.1 -p 4061 -t 60000`.
    pub fn options(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Tcp(tcp) => tcp.options(&mut out),
            Self::Udp(udp) => udp.options(&mut out),
            Self::Ws(ws) => ws.options(&mut out),
            Self::Opaque(opaque) => opaque.options(&mut out),
        }
        out
    }

    /// Writes the type id followed by the encapsulated body.
    pub fn stream_write(&self, stream: &mut OutputStream) {
        if let Self::Opaque(opaque) = self {
            opaque.write(stream);
            return;
        }
        stream.write_i16(self.type_id());
        stream.start_encapsulation(stream.encoding());
        self.write_body(stream);
        stream.end_encapsulation();
    }

    pub(crate) fn write_body(&self, stream: &mut OutputStream) {
        match self {
            Self::Tcp(tcp) => tcp.write(stream),
            Self::Udp(udp) => udp.write(stream),
            Self::Ws(ws) => ws.write(stream),
            Self::Opaque(opaque) => stream.write_blob(opaque.raw_bytes()),
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Self::Tcp(_) => 0,
            Self::Udp(_) => 1,
            Self::Ws(_) => 2,
            Self::Opaque(_) => 3,
        }
    }
}

fn fill_ip_info(info: &mut EndpointInfo, ip: &IpEndpoint) {
    info.host = ip.host().to_string();
    info.port = ip.port();
    info.source_address = ip.source_address();
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.protocol(), self.options())
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Endpoint {}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_id()
            .cmp(&other.type_id())
            .then_with(|| self.variant_rank().cmp(&other.variant_rank()))
            .then_with(|| match (self, other) {
                (Self::Tcp(a), Self::Tcp(b)) => a.cmp(b),
                (Self::Udp(a), Self::Udp(b)) => a.cmp(b),
                (Self::Ws(a), Self::Ws(b)) => a.cmp(b),
                (Self::Opaque(a), Self::Opaque(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id().hash(state);
        match self {
            Self::Tcp(tcp) => tcp.hash(state),
            Self::Udp(udp) => udp.hash(state),
            Self::Ws(ws) => ws.hash(state),
            Self::Opaque(opaque) => opaque.hash(state),
        }
    }
}

/// Splits an endpoint string on whitespace, honouring `"` and `'`
/// quoting. Returns `None` on an unterminated quote.
pub(crate) fn tokenize(text: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

/// Wraps `value` in double quotes when it contains `:`.
pub(crate) fn quote_if_needed(value: &str) -> String {
    if value.contains(':') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Runs `check` over the `-option [argument]` pairs of `args`.
///
/// An argument is attached to an option only if it does not itself start
/// with `-`; a missing argument is passed as `""`. `check` returns
/// `Ok(false)` for options it does not know; those (and their argument)
/// are left in `args` for the next layer or for the
/// "unrecognized argument" error. The third argument of `check` is the
/// quoted endpoint text used in error messages.
pub(crate) fn parse_options(
    protocol: &str,
    args: &mut Vec<String>,
    mut check: impl FnMut(&str, &str, &str) -> Result<bool>,
) -> Result<()> {
    let mut endpoint = format!("`{protocol}");
    for arg in args.iter() {
        if arg.chars().any(char::is_whitespace) {
            endpoint.push_str(&format!(" \"{arg}\""));
        } else {
            endpoint.push(' ');
            endpoint.push_str(arg);
        }
    }
    endpoint.push('\'');

    let mut unknown = Vec::new();
    let mut index = 0;
    while index < args.len() {
        let option = args[index].clone();
        index += 1;

        if option.len() < 2 || !option.starts_with('-') {
            unknown.push(option);
            continue;
        }

        let mut argument = String::new();
        if index < args.len() && !args[index].starts_with('-') {
            argument = args[index].clone();
            index += 1;
        }

        if !check(&option, &argument, &endpoint)? {
            unknown.push(option);
            if !argument.is_empty() {
                unknown.push(argument);
            }
        }
    }

    *args = unknown;
    Ok(())
}

/// Error for tokens no layer consumed.
pub(crate) fn unrecognized(args: &[String], text: &str) -> TransportError {
    TransportError::parse(format!(
        "unrecognized argument `{}' in endpoint `{text}'",
        args.first().map(String::as_str).unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_honours_quotes() {
        assert_eq!(
            tokenize("tcp -h \"::1\"  -p 10 -r '/a b'").unwrap(),
            vec!["tcp", "-h", "::1", "-p", "10", "-r", "/a b"]
        );
        assert!(tokenize("tcp -h \"::1").is_none());
    }

    #[test]
    fn options_leave_unknown_tokens() {
        let mut args: Vec<String> = ["-x", "1", "-h", "host", "-q"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut host = String::new();
        parse_options("tcp", &mut args, |option, argument, _| {
            if option == "-h" {
                host = argument.to_string();
                return Ok(true);
            }
            Ok(false)
        })
        .unwrap();
        assert_eq!(host, "host");
        assert_eq!(args, vec!["-x", "1", "-q"]);
    }

    #[test]
    fn only_colon_values_are_quoted() {
        assert_eq!(quote_if_needed("::1"), "\"::1\"");
        assert_eq!(quote_if_needed("localhost"), "localhost");
    }
}
