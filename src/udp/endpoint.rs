//! UDP endpoint:
//! `udp -h host -p port [--sourceAddress a] [--interface i] [--ttl n] [-c] [-z]`.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use crate::connector::Connector;
use crate::endpoint::ip::{IpEndpoint, IpEndpointBuilder};
use crate::endpoint::{Endpoint, parse_options, quote_if_needed};
use crate::error::{Result, TransportError};
use crate::instance::ProtocolInstance;
use crate::stream::{EncodingVersion, InputStream, OutputStream};
use crate::transceiver::Transceiver;
use crate::udp::connector::UdpConnector;
use crate::udp::transceiver::UdpTransceiver;

#[derive(Debug, Clone)]
pub struct UdpEndpoint {
    pub(crate) ip: IpEndpoint,
    mcast_interface: String,
    mcast_ttl: i32,
    connect: bool,
    compress: bool,
}

impl UdpEndpoint {
    pub(crate) fn parse(
        instance: Arc<ProtocolInstance>,
        args: &mut Vec<String>,
        adapter: bool,
    ) -> Result<Self> {
        let mut builder = UdpEndpointBuilder {
            ip: IpEndpointBuilder::default(),
            mcast_interface: String::new(),
            mcast_ttl: -1,
            connect: false,
            compress: false,
        };
        parse_options(instance.protocol(), args, |option, argument, endpoint| {
            builder.check_option(option, argument, endpoint)
        })?;
        builder.build(instance, adapter)
    }

    /// Decodes the body. Under encoding 1.0 a fixed protocol/encoding
    /// marker precedes the compression flag.
    pub(crate) fn read(instance: Arc<ProtocolInstance>, stream: &mut InputStream) -> Result<Self> {
        let ip = IpEndpoint::read(instance, stream)?;
        if stream.encoding() == EncodingVersion::V1_0 {
            stream.read_blob(4)?;
        }
        let compress = stream.read_bool()?;
        Ok(Self {
            ip,
            mcast_interface: String::new(),
            mcast_ttl: -1,
            connect: false,
            compress,
        })
    }

    pub(crate) fn write(&self, stream: &mut OutputStream) {
        self.ip.write(stream);
        if stream.encoding() == EncodingVersion::V1_0 {
            stream.write_blob(&[1, 0, 1, 0]);
        }
        stream.write_bool(self.compress);
    }

    pub(crate) fn options(&self, out: &mut String) {
        self.ip.options(out);
        render_udp_options(
            &self.mcast_interface,
            self.mcast_ttl,
            self.connect,
            self.compress,
            out,
        );
    }

    pub fn mcast_interface(&self) -> &str {
        &self.mcast_interface
    }

    pub fn mcast_ttl(&self) -> i32 {
        self.mcast_ttl
    }

    pub fn connect(&self) -> bool {
        self.connect
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub(crate) fn with_compress(&self, compress: bool) -> Self {
        Self {
            compress,
            ..self.clone()
        }
    }

    pub(crate) fn with_ip(&self, ip: IpEndpoint) -> Self {
        Self { ip, ..self.clone() }
    }

    pub(crate) fn connectors(&self, addresses: &[SocketAddr]) -> Vec<Connector> {
        addresses
            .iter()
            .map(|address| {
                Connector::Udp(UdpConnector::new(
                    self.ip.instance.clone(),
                    *address,
                    self.ip.source_address,
                    self.mcast_interface.clone(),
                    self.mcast_ttl,
                    self.ip.connection_id.clone(),
                ))
            })
            .collect()
    }

    /// Creates the server-side socket for this endpoint; the caller binds
    /// it with [`Transceiver::bind`].
    pub(crate) fn server_transceiver(
        endpoint: &Arc<Endpoint>,
        udp: &Self,
    ) -> Result<Box<dyn Transceiver>> {
        Ok(Box::new(UdpTransceiver::server(
            endpoint.clone(),
            udp.ip.instance.clone(),
            &udp.ip.host,
            udp.ip.port,
            &udp.mcast_interface,
            udp.connect,
        )?))
    }

    pub(crate) fn equivalent(&self, other: &Self) -> bool {
        self.ip.equivalent(&other.ip)
    }

    fn key(&self) -> (&IpEndpoint, &str, i32, bool, bool) {
        (
            &self.ip,
            &self.mcast_interface,
            self.mcast_ttl,
            self.connect,
            self.compress,
        )
    }
}

fn render_udp_options(interface: &str, ttl: i32, connect: bool, compress: bool, out: &mut String) {
    if !interface.is_empty() {
        out.push_str(" --interface ");
        out.push_str(&quote_if_needed(interface));
    }
    if ttl != -1 {
        out.push_str(&format!(" --ttl {ttl}"));
    }
    if connect {
        out.push_str(" -c");
    }
    if compress {
        out.push_str(" -z");
    }
}

impl PartialEq for UdpEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UdpEndpoint {}

impl PartialOrd for UdpEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UdpEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for UdpEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

struct UdpEndpointBuilder {
    ip: IpEndpointBuilder,
    mcast_interface: String,
    mcast_ttl: i32,
    connect: bool,
    compress: bool,
}

impl UdpEndpointBuilder {
    fn check_option(&mut self, option: &str, argument: &str, endpoint: &str) -> Result<bool> {
        if self.ip.check_option(option, argument, endpoint)? {
            return Ok(true);
        }

        match option {
            "-c" | "-z" => {
                if !argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "unexpected argument `{argument}' provided for {option} option in {endpoint}"
                    )));
                }
                if option == "-c" {
                    self.connect = true;
                } else {
                    self.compress = true;
                }
            }
            "-v" | "-e" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for {option} option in endpoint {endpoint}"
                    )));
                }
                let version = EncodingVersion::parse(argument).ok_or_else(|| {
                    TransportError::parse(format!(
                        "invalid version `{argument}' provided for {option} option in endpoint {endpoint}"
                    ))
                })?;
                if version != EncodingVersion::V1_0 {
                    warn!(
                        option,
                        version = %version,
                        "deprecated udp endpoint option, ignoring version"
                    );
                }
            }
            "--ttl" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for --ttl option in endpoint {endpoint}"
                    )));
                }
                let ttl: i32 = argument.parse().map_err(|_| {
                    TransportError::parse(format!(
                        "invalid TTL value `{argument}' in endpoint {endpoint}"
                    ))
                })?;
                if ttl < 0 {
                    return Err(TransportError::parse(format!(
                        "TTL value `{argument}' out of range in endpoint {endpoint}"
                    )));
                }
                self.mcast_ttl = ttl;
            }
            "--interface" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for --interface option in endpoint {endpoint}"
                    )));
                }
                self.mcast_interface = argument.to_string();
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn build(mut self, instance: Arc<ProtocolInstance>, adapter: bool) -> Result<UdpEndpoint> {
        let mut rendered = instance.protocol().to_string();
        self.ip.options(&mut rendered);
        render_udp_options(
            &self.mcast_interface,
            self.mcast_ttl,
            self.connect,
            self.compress,
            &mut rendered,
        );

        if self.mcast_interface == "*" {
            if !adapter {
                return Err(TransportError::parse(format!(
                    "`--interface *' not valid for proxy endpoint `{rendered}'"
                )));
            }
            self.mcast_interface.clear();
        }

        Ok(UdpEndpoint {
            ip: self.ip.build(instance, adapter, &rendered)?,
            mcast_interface: self.mcast_interface,
            mcast_ttl: self.mcast_ttl,
            connect: self.connect,
            compress: self.compress,
        })
    }
}
