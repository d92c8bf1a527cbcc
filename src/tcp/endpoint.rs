//! TCP endpoint: `tcp -h host -p port [--sourceAddress a] -t timeout [-z]`.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connector::Connector;
use crate::endpoint::ip::{IpEndpoint, IpEndpointBuilder};
use crate::endpoint::{Endpoint, parse_options};
use crate::error::{Result, TransportError};
use crate::instance::ProtocolInstance;
use crate::network::proxy::NetworkProxy;
use crate::stream::{InputStream, OutputStream};
use crate::tcp::acceptor::TcpAcceptor;
use crate::tcp::connector::TcpConnector;
use crate::transceiver::Acceptor;

#[derive(Debug, Clone)]
pub struct TcpEndpoint {
    pub(crate) ip: IpEndpoint,
    timeout: i32,
    compress: bool,
}

impl TcpEndpoint {
    /// Parses TCP options out of `args`, leaving unrecognized ones behind.
    pub(crate) fn parse(
        instance: Arc<ProtocolInstance>,
        args: &mut Vec<String>,
        adapter: bool,
    ) -> Result<Self> {
        let mut builder = TcpEndpointBuilder {
            ip: IpEndpointBuilder::default(),
            timeout: instance.config().default_timeout,
            compress: false,
        };
        parse_options(instance.protocol(), args, |option, argument, endpoint| {
            builder.check_option(option, argument, endpoint)
        })?;
        builder.build(instance, adapter)
    }

    pub(crate) fn read(instance: Arc<ProtocolInstance>, stream: &mut InputStream) -> Result<Self> {
        let ip = IpEndpoint::read(instance, stream)?;
        let timeout = stream.read_i32()?;
        let compress = stream.read_bool()?;
        Ok(Self {
            ip,
            timeout,
            compress,
        })
    }

    pub(crate) fn write(&self, stream: &mut OutputStream) {
        self.ip.write(stream);
        stream.write_i32(self.timeout);
        stream.write_bool(self.compress);
    }

    pub(crate) fn options(&self, out: &mut String) {
        self.ip.options(out);
        render_timeout(self.timeout, self.compress, out);
    }

    pub fn timeout(&self) -> i32 {
        self.timeout
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub(crate) fn with_timeout(&self, timeout: i32) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
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

    pub(crate) fn connectors(
        &self,
        addresses: &[SocketAddr],
        proxy: Option<&NetworkProxy>,
    ) -> Vec<Connector> {
        addresses
            .iter()
            .map(|address| {
                Connector::Tcp(TcpConnector::new(
                    self.ip.instance.clone(),
                    *address,
                    proxy.cloned(),
                    self.ip.source_address,
                    self.timeout,
                    self.ip.connection_id.clone(),
                ))
            })
            .collect()
    }

    pub(crate) fn acceptor(
        endpoint: &Arc<Endpoint>,
        tcp: &Self,
        adapter_name: &str,
    ) -> Result<Box<dyn Acceptor>> {
        Ok(Box::new(TcpAcceptor::new(
            endpoint.clone(),
            tcp.ip.instance.clone(),
            &tcp.ip.host,
            tcp.ip.port,
            adapter_name,
        )?))
    }

    fn key(&self) -> (&IpEndpoint, i32, bool) {
        (&self.ip, self.timeout, self.compress)
    }
}

fn render_timeout(timeout: i32, compress: bool, out: &mut String) {
    if timeout == -1 {
        out.push_str(" -t infinite");
    } else {
        out.push_str(&format!(" -t {timeout}"));
    }
    if compress {
        out.push_str(" -z");
    }
}

impl PartialEq for TcpEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TcpEndpoint {}

impl PartialOrd for TcpEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TcpEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for TcpEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

struct TcpEndpointBuilder {
    ip: IpEndpointBuilder,
    timeout: i32,
    compress: bool,
}

impl TcpEndpointBuilder {
    fn check_option(&mut self, option: &str, argument: &str, endpoint: &str) -> Result<bool> {
        if self.ip.check_option(option, argument, endpoint)? {
            return Ok(true);
        }

        match option {
            "-t" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for -t option in endpoint {endpoint}"
                    )));
                }
                if argument == "infinite" {
                    self.timeout = -1;
                } else {
                    self.timeout = argument
                        .parse::<i32>()
                        .ok()
                        .filter(|timeout| *timeout >= 1)
                        .ok_or_else(|| {
                            TransportError::parse(format!(
                                "invalid timeout value `{argument}' in endpoint {endpoint}"
                            ))
                        })?;
                }
            }
            "-z" => {
                if !argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "unexpected argument `{argument}' provided for -z option in {endpoint}"
                    )));
                }
                self.compress = true;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn build(self, instance: Arc<ProtocolInstance>, adapter: bool) -> Result<TcpEndpoint> {
        let mut rendered = instance.protocol().to_string();
        self.ip.options(&mut rendered);
        render_timeout(self.timeout, self.compress, &mut rendered);

        Ok(TcpEndpoint {
            ip: self.ip.build(instance, adapter, &rendered)?,
            timeout: self.timeout,
            compress: self.compress,
        })
    }
}
