//! Fields and option handling shared by the IP transports (TCP and UDP).

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::endpoint::quote_if_needed;
use crate::error::{Result, TransportError};
use crate::instance::ProtocolInstance;
use crate::network::address;
use crate::stream::{InputStream, OutputStream};

/// Host, port, bind source and connection id of an IP endpoint.
#[derive(Debug, Clone)]
pub struct IpEndpoint {
    pub(crate) instance: Arc<ProtocolInstance>,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) connection_id: String,
}

impl IpEndpoint {
    pub fn instance(&self) -> &Arc<ProtocolInstance> {
        &self.instance
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn source_address(&self) -> Option<IpAddr> {
        self.source_address
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub(crate) fn with_host(&self, host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn with_address(&self, address: &SocketAddr) -> Self {
        Self {
            host: address::ip_to_string(&address.ip()),
            port: address.port(),
            ..self.clone()
        }
    }

    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub(crate) fn with_connection_id(&self, connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            ..self.clone()
        }
    }

    /// Decodes `host:string, port:i32`.
    pub(crate) fn read(instance: Arc<ProtocolInstance>, stream: &mut InputStream) -> Result<Self> {
        let host = stream.read_string()?;
        let port = stream.read_i32()?;
        let port = u16::try_from(port)
            .map_err(|_| TransportError::marshal(format!("port {port} out of range")))?;
        Ok(Self {
            instance,
            host,
            port,
            source_address: None,
            connection_id: String::new(),
        })
    }

    pub(crate) fn write(&self, stream: &mut OutputStream) {
        stream.write_string(&self.host);
        stream.write_i32(self.port as i32);
    }

    /// Appends ` -h host -p port [--sourceAddress addr]`.
    pub(crate) fn options(&self, out: &mut String) {
        if !self.host.is_empty() {
            out.push_str(" -h ");
            out.push_str(&quote_if_needed(&self.host));
        }
        out.push_str(&format!(" -p {}", self.port));
        if let Some(source) = &self.source_address {
            out.push_str(" --sourceAddress ");
            out.push_str(&quote_if_needed(&address::ip_to_string(source)));
        }
    }

    /// Same destination, ignoring the connection id and source address.
    pub(crate) fn equivalent(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }

    fn key(&self) -> (&str, u16, &str, Option<IpAddr>) {
        (
            &self.host,
            self.port,
            &self.connection_id,
            self.source_address,
        )
    }
}

impl PartialEq for IpEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for IpEndpoint {}

impl PartialOrd for IpEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for IpEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Mutable record filled while parsing `-h`, `-p` and `--sourceAddress`.
#[derive(Debug, Clone, Default)]
pub(crate) struct IpEndpointBuilder {
    host: String,
    port: u16,
    source_address: Option<IpAddr>,
}

impl IpEndpointBuilder {
    pub(crate) fn check_option(&mut self, option: &str, argument: &str, endpoint: &str) -> Result<bool> {
        match option {
            "-h" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for -h option in endpoint {endpoint}"
                    )));
                }
                self.host = argument.to_string();
            }
            "-p" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for -p option in endpoint {endpoint}"
                    )));
                }
                let port: i64 = argument.parse().map_err(|_| {
                    TransportError::parse(format!(
                        "invalid port value `{argument}' in endpoint {endpoint}"
                    ))
                })?;
                self.port = u16::try_from(port).map_err(|_| {
                    TransportError::parse(format!(
                        "port value `{argument}' out of range in endpoint {endpoint}"
                    ))
                })?;
            }
            "--sourceAddress" => {
                if argument.is_empty() {
                    return Err(TransportError::parse(format!(
                        "no argument provided for --sourceAddress option in endpoint {endpoint}"
                    )));
                }
                let source = address::parse_numeric(argument).ok_or_else(|| {
                    TransportError::parse(format!(
                        "invalid IP address provided for --sourceAddress option in endpoint {endpoint}"
                    ))
                })?;
                self.source_address = Some(source);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Renders the options parsed so far, for error messages raised after
    /// parsing.
    pub(crate) fn options(&self, out: &mut String) {
        if !self.host.is_empty() {
            out.push_str(" -h ");
            out.push_str(&quote_if_needed(&self.host));
        }
        out.push_str(&format!(" -p {}", self.port));
        if let Some(source) = &self.source_address {
            out.push_str(" --sourceAddress ");
            out.push_str(&quote_if_needed(&address::ip_to_string(source)));
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    /// Applies the defaults and the adapter/client restrictions, then
    /// freezes the record. `rendered` is the full endpoint text used in
    /// error messages.
    pub(crate) fn build(
        mut self,
        instance: Arc<ProtocolInstance>,
        adapter: bool,
        rendered: &str,
    ) -> Result<IpEndpoint> {
        if self.host.is_empty() {
            self.host = instance.default_host().to_string();
        } else if self.host == "*" {
            if !adapter {
                return Err(TransportError::parse(format!(
                    "`-h *' not valid for proxy endpoint `{rendered}'"
                )));
            }
            self.host.clear();
        }

        if self.source_address.is_some() {
            if adapter {
                return Err(TransportError::parse(format!(
                    "`--sourceAddress' not valid for object adapter endpoint `{rendered}'"
                )));
            }
        } else if !adapter {
            self.source_address = instance.default_source_address();
        }

        Ok(IpEndpoint {
            instance,
            host: self.host,
            port: self.port,
            source_address: self.source_address,
            connection_id: String::new(),
        })
    }
}
